//! Out-of-space admission
//!
//! The space tracker publishes pressure flags into a shared
//! [`OutOfSpaceState`]; the skeleton reads them on every write-class request
//! and never caches them beyond that request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use vdisk_common::{OutOfSpaceFlags, SpaceColor};

/// Space pressure shared between the space tracker and the skeleton
#[derive(Clone, Debug, Default)]
pub struct OutOfSpaceState(Arc<AtomicU32>);

impl OutOfSpaceState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn flags(&self) -> OutOfSpaceFlags {
        OutOfSpaceFlags::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, flags: OutOfSpaceFlags) {
        self.0.store(flags.bits(), Ordering::Release);
    }
}

/// Space class of a write-class request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteClass {
    /// Client put and multi-put
    Put,
    /// Block and garbage-collect, which free space eventually
    Maintenance,
    /// Sync data, repair writes, phantom and handoff deletions
    Internal,
}

#[derive(Clone, Debug)]
pub struct OutOfSpaceLogic {
    state: OutOfSpaceState,
}

impl OutOfSpaceLogic {
    #[must_use]
    pub const fn new(state: OutOfSpaceState) -> Self {
        Self { state }
    }

    #[must_use]
    pub fn flags(&self) -> OutOfSpaceFlags {
        self.state.flags()
    }

    /// Whether a request of `class` may be admitted right now
    #[must_use]
    pub fn allow(&self, class: WriteClass) -> bool {
        let color = self.flags().color();
        match class {
            WriteClass::Put => color < SpaceColor::Orange,
            WriteClass::Maintenance | WriteClass::Internal => color < SpaceColor::Red,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers() {
        let state = OutOfSpaceState::new();
        let logic = OutOfSpaceLogic::new(state.clone());
        assert!(logic.allow(WriteClass::Put));

        state.set(OutOfSpaceFlags::YELLOW);
        assert!(logic.allow(WriteClass::Put));

        state.set(OutOfSpaceFlags::YELLOW | OutOfSpaceFlags::ORANGE);
        assert!(!logic.allow(WriteClass::Put));
        assert!(logic.allow(WriteClass::Maintenance));
        assert!(logic.allow(WriteClass::Internal));

        state.set(OutOfSpaceFlags::RED);
        assert!(!logic.allow(WriteClass::Put));
        assert!(!logic.allow(WriteClass::Maintenance));
        assert!(!logic.allow(WriteClass::Internal));

        state.set(OutOfSpaceFlags::NONE);
        assert!(logic.allow(WriteClass::Put));
    }
}
