//! Construction of the skeleton's collaborators
//!
//! After local recovery the skeleton starts its long-lived collaborators in
//! a fixed order through a [`SubsystemLauncher`]. The skeleton keeps only
//! the returned addresses; the launcher decides what runs behind them.

use crate::messages::{Addr, HugeKeeperMsg, LogWriterMsg, PatchMsg, PatchStart, PeerMsg, SkeletonMsg};
use crate::oos::OutOfSpaceState;
use derive_more::Display;
use std::sync::Arc;
use vdisk_common::{GroupInfo, Lsn, VDiskConfig, VDiskId};

/// Long-lived peer-facing subsystems
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
pub enum Subsystem {
    SpaceTracker,
    HandoffProxies,
    LogCutter,
    SyncLog,
    Syncer,
    Repl,
    Anubis,
    Defrag,
    Scrub,
}

impl Subsystem {
    /// Whether the subsystem holds log positions and must hear about cuts
    #[must_use]
    pub const fn wants_cut_log(self) -> bool {
        matches!(self, Self::LogCutter | Self::SyncLog | Self::Syncer | Self::Scrub)
    }
}

/// What a launcher gets to know about the unit it starts collaborators for
pub struct LaunchCtx<'a> {
    pub skeleton: &'a Addr<SkeletonMsg>,
    pub vdisk_id: VDiskId,
    pub group: &'a Arc<GroupInfo>,
    pub config: &'a Arc<VDiskConfig>,
    /// Highest lsn found by local recovery
    pub recovered_lsn: Lsn,
    pub space: &'a OutOfSpaceState,
}

pub trait SubsystemLauncher: Send {
    fn log_writer(&mut self, ctx: &LaunchCtx<'_>) -> Addr<LogWriterMsg>;

    fn huge_keeper(&mut self, ctx: &LaunchCtx<'_>) -> Addr<HugeKeeperMsg>;

    fn subsystem(&mut self, kind: Subsystem, ctx: &LaunchCtx<'_>) -> Addr<PeerMsg>;

    /// Open a patch session for `start.original_id`
    fn patch_session(&mut self, start: &PatchStart, ctx: &LaunchCtx<'_>) -> Addr<PatchMsg>;
}
