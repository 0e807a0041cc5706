//! Logged-record vault
//!
//! Holds the bookkeeping of every write between submission to the log
//! writer and its durability confirmation. Records live in a generational
//! arena: a handle names a slot plus the generation the slot had when the
//! record went in, so a stale or forged handle can never reach a newer
//! record reusing the slot.

use crate::logged_rec::LoggedRecord;
use std::collections::BTreeMap;
use std::fmt;
use tracing::error;
use vdisk_common::Lsn;

/// Opaque handle of a vaulted record, carried through the log writer
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VaultHandle(u64);

impl VaultHandle {
    const fn new(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | index as u64)
    }

    const fn index(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for VaultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultHandle({}v{})", self.index(), self.generation())
    }
}

enum Slot {
    Vacant { generation: u32 },
    Occupied { generation: u32, record: LoggedRecord },
}

/// Registry of in-flight logged records
#[derive(Default)]
pub struct LoggedRecsVault {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Last lsn of every vaulted record, with multiplicity
    in_flight: BTreeMap<Lsn, usize>,
    len: usize,
}

impl LoggedRecsVault {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record and return its handle
    pub fn put(&mut self, record: LoggedRecord) -> VaultHandle {
        *self.in_flight.entry(record.seg.last).or_default() += 1;
        self.len += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let generation = match slot {
                Slot::Vacant { generation } => generation.wrapping_add(1),
                Slot::Occupied { .. } => unreachable!("free list points at an occupied slot"),
            };
            *slot = Slot::Occupied { generation, record };
            return VaultHandle::new(index, generation);
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot::Occupied { generation: 0, record });
        VaultHandle::new(index, 0)
    }

    /// Remove and return the record behind `handle`
    ///
    /// A handle the vault does not hold means the log writer confirmed an
    /// entry that was never registered, or confirmed one twice. Both corrupt
    /// the reply ordering, so this panics.
    pub fn extract(&mut self, handle: VaultHandle) -> LoggedRecord {
        let index = handle.index();
        let matches = matches!(
            self.slots.get(index),
            Some(Slot::Occupied { generation, .. }) if *generation == handle.generation()
        );
        if !matches {
            error!(?handle, "vault handle not found");
            panic!("vault handle {handle:?} not found");
        }

        let vacant = Slot::Vacant {
            generation: handle.generation(),
        };
        let Slot::Occupied { record, .. } = std::mem::replace(&mut self.slots[index], vacant) else {
            unreachable!("slot checked occupied above");
        };
        self.free.push(index as u32);
        self.len -= 1;

        let last = record.seg.last;
        if let Some(count) = self.in_flight.get_mut(&last) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&last);
            }
        }
        record
    }

    /// Extract a batch of records in the given order
    pub fn extract_many(&mut self, handles: &[VaultHandle]) -> Vec<LoggedRecord> {
        handles.iter().map(|h| self.extract(*h)).collect()
    }

    /// Highest lsn of any record not yet extracted
    #[must_use]
    pub fn last_lsn_in_flight(&self) -> Option<Lsn> {
        self.in_flight.last_key_value().map(|(lsn, _)| *lsn)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logged_rec::LoggedRecordKind;
    use crate::messages::{Addr, ReplyTo};
    use rand::seq::SliceRandom;
    use vdisk_common::{LogoBlobId, LsnSeg};

    fn record(first: Lsn, last: Lsn) -> LoggedRecord {
        let (addr, _rx) = Addr::channel();
        LoggedRecord::new(
            LsnSeg::new(first, last),
            false,
            LoggedRecordKind::HandoffDel {
                id: LogoBlobId::new(1, 1, first as u32, 0, 0, 0),
                reply: ReplyTo::new(addr, first),
            },
        )
    }

    #[test]
    fn test_put_extract() {
        let mut vault = LoggedRecsVault::new();
        let a = vault.put(record(1, 1));
        let b = vault.put(record(2, 4));
        assert_eq!(vault.len(), 2);
        assert_eq!(vault.last_lsn_in_flight(), Some(4));

        assert_eq!(vault.extract(b).seg, LsnSeg::new(2, 4));
        assert_eq!(vault.last_lsn_in_flight(), Some(1));
        assert_eq!(vault.extract(a).seg, LsnSeg::point(1));
        assert!(vault.is_empty());
        assert_eq!(vault.last_lsn_in_flight(), None);
    }

    #[test]
    fn test_slot_reuse_changes_handle() {
        let mut vault = LoggedRecsVault::new();
        let a = vault.put(record(1, 1));
        vault.extract(a);
        let b = vault.put(record(2, 2));
        assert_ne!(a, b);
        assert_eq!(vault.extract(b).seg.first, 2);
    }

    #[test]
    #[should_panic(expected = "not found")]
    fn test_double_extract_panics() {
        let mut vault = LoggedRecsVault::new();
        let a = vault.put(record(1, 1));
        vault.extract(a);
        vault.extract(a);
    }

    #[test]
    #[should_panic(expected = "not found")]
    fn test_stale_handle_panics() {
        let mut vault = LoggedRecsVault::new();
        let a = vault.put(record(1, 1));
        vault.extract(a);
        let _b = vault.put(record(2, 2));
        // same slot, older generation
        vault.extract(a);
    }

    #[test]
    fn test_extract_many_any_order() {
        let mut vault = LoggedRecsVault::new();
        let mut handles: Vec<_> = (1..=64).map(|lsn| vault.put(record(lsn, lsn))).collect();
        handles.shuffle(&mut rand::thread_rng());
        let (first, rest) = handles.split_at(10);
        let records = vault.extract_many(first);
        assert_eq!(records.len(), 10);
        assert_eq!(vault.len(), 54);
        let records = vault.extract_many(rest);
        assert_eq!(records.len(), 54);
        assert!(vault.is_empty());
        assert_eq!(vault.last_lsn_in_flight(), None);
    }

    #[test]
    fn test_duplicate_last_lsn() {
        let mut vault = LoggedRecsVault::new();
        let a = vault.put(record(3, 3));
        let b = vault.put(record(3, 3));
        vault.extract(a);
        assert_eq!(vault.last_lsn_in_flight(), Some(3));
        vault.extract(b);
        assert_eq!(vault.last_lsn_in_flight(), None);
    }
}
