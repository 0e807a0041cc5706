//! Log sequence number allocation and confirmation
//!
//! Segments are handed out in admission order. Confirmation may arrive out
//! of order (a huge blob is logged after ordinary writes admitted later),
//! but the confirmed high-water mark only moves past a segment once every
//! earlier segment is confirmed too.

use std::collections::BTreeMap;
use tracing::error;
use vdisk_common::{Lsn, LsnSeg};

/// Sequence numbers issued but not yet durable, keyed by first lsn
#[derive(Debug, Default)]
struct InFlight {
    segs: BTreeMap<Lsn, Lsn>,
}

impl InFlight {
    fn insert(&mut self, seg: LsnSeg) {
        self.segs.insert(seg.first, seg.last);
    }

    /// Remove `seg`, which may be a piece of a larger issued segment (a
    /// multi-put confirms its items one lsn at a time)
    fn remove(&mut self, seg: LsnSeg) -> bool {
        let Some((&first, &last)) = self.segs.range(..=seg.first).next_back() else {
            return false;
        };
        if last < seg.last {
            return false;
        }
        self.segs.remove(&first);
        if first < seg.first {
            self.segs.insert(first, seg.first - 1);
        }
        if seg.last < last {
            self.segs.insert(seg.last + 1, last);
        }
        true
    }

    /// Highest lsn below which nothing is in flight
    fn confirmed(&self, allocated: Lsn) -> Lsn {
        self.segs
            .first_key_value()
            .map_or(allocated, |(first, _)| first - 1)
    }
}

/// Allocator of log sequence numbers for one storage unit
#[derive(Debug)]
pub struct LsnManager {
    /// Last lsn handed out
    current: Lsn,
    originally_recovered: Lsn,
    hull: InFlight,
    sync_log: InFlight,
}

impl LsnManager {
    /// Start after the highest lsn found by local recovery
    #[must_use]
    pub fn new(recovered_lsn: Lsn) -> Self {
        Self {
            current: recovered_lsn,
            originally_recovered: recovered_lsn,
            hull: InFlight::default(),
            sync_log: InFlight::default(),
        }
    }

    fn alloc(&mut self, count: u64) -> LsnSeg {
        assert!(count > 0, "lsn batch must not be empty");
        let seg = LsnSeg::new(self.current + 1, self.current + count);
        self.current = seg.last;
        seg
    }

    /// Reserve `count` sequence numbers confirmed on the index only
    pub fn alloc_for_hull(&mut self, count: u64) -> LsnSeg {
        let seg = self.alloc(count);
        self.hull.insert(seg);
        seg
    }

    /// Reserve `count` sequence numbers that also produce sync-log entries
    pub fn alloc_for_hull_and_sync_log(&mut self, count: u64) -> LsnSeg {
        let seg = self.alloc(count);
        self.hull.insert(seg);
        self.sync_log.insert(seg);
        seg
    }

    /// Mark a segment durable. Panics if the segment was never issued.
    pub fn confirm_for_hull(&mut self, seg: LsnSeg, confirm_sync_log_also: bool) {
        if !self.hull.remove(seg) {
            error!(%seg, "confirming lsn segment that is not in flight");
            panic!("confirming lsn segment {seg} that is not in flight");
        }
        if confirm_sync_log_also && !self.sync_log.remove(seg) {
            error!(%seg, "confirming sync log segment that is not in flight");
            panic!("confirming sync log segment {seg} that is not in flight");
        }
    }

    /// Highest sequence number with everything at or below it durable
    #[must_use]
    pub fn confirmed_lsn(&self) -> Lsn {
        self.hull.confirmed(self.current)
    }

    #[must_use]
    pub fn confirmed_sync_log_lsn(&self) -> Lsn {
        self.sync_log.confirmed(self.current)
    }

    /// Last sequence number handed out
    #[must_use]
    pub const fn current_lsn(&self) -> Lsn {
        self.current
    }

    /// Lsn recovered from the log at startup
    #[must_use]
    pub const fn originally_recovered_lsn(&self) -> Lsn {
        self.originally_recovered
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.hull.segs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_is_contiguous() {
        let mut lsn = LsnManager::new(10);
        assert_eq!(lsn.alloc_for_hull(1), LsnSeg::point(11));
        assert_eq!(lsn.alloc_for_hull_and_sync_log(3), LsnSeg::new(12, 14));
        assert_eq!(lsn.current_lsn(), 14);
        assert_eq!(lsn.originally_recovered_lsn(), 10);
        assert_eq!(lsn.confirmed_lsn(), 10);
    }

    #[test]
    fn test_confirmation_is_monotonic() {
        let mut lsn = LsnManager::new(0);
        let a = lsn.alloc_for_hull(1);
        let b = lsn.alloc_for_hull(2);
        let c = lsn.alloc_for_hull(1);

        // Later segments confirmed first do not move the mark
        lsn.confirm_for_hull(c, false);
        assert_eq!(lsn.confirmed_lsn(), 0);
        lsn.confirm_for_hull(a, false);
        assert_eq!(lsn.confirmed_lsn(), 1);
        lsn.confirm_for_hull(b, false);
        assert_eq!(lsn.confirmed_lsn(), 4);
        assert_eq!(lsn.in_flight(), 0);
    }

    #[test]
    fn test_sync_log_tracked_separately() {
        let mut lsn = LsnManager::new(0);
        let a = lsn.alloc_for_hull_and_sync_log(1);
        let b = lsn.alloc_for_hull(1);
        lsn.confirm_for_hull(b, false);
        assert_eq!(lsn.confirmed_sync_log_lsn(), 0);
        lsn.confirm_for_hull(a, true);
        assert_eq!(lsn.confirmed_sync_log_lsn(), 2);
        assert_eq!(lsn.confirmed_lsn(), 2);
    }

    #[test]
    fn test_confirm_pieces_of_a_segment() {
        let mut lsn = LsnManager::new(0);
        let batch = lsn.alloc_for_hull_and_sync_log(3);
        lsn.confirm_for_hull(LsnSeg::point(2), true);
        assert_eq!(lsn.confirmed_lsn(), 0);
        lsn.confirm_for_hull(LsnSeg::point(1), true);
        assert_eq!(lsn.confirmed_lsn(), 2);
        lsn.confirm_for_hull(LsnSeg::point(batch.last), true);
        assert_eq!(lsn.confirmed_lsn(), 3);
        assert_eq!(lsn.confirmed_sync_log_lsn(), 3);
        assert_eq!(lsn.in_flight(), 0);
    }

    #[test]
    #[should_panic(expected = "not in flight")]
    fn test_double_confirm_panics() {
        let mut lsn = LsnManager::new(0);
        let a = lsn.alloc_for_hull(1);
        lsn.confirm_for_hull(a, false);
        lsn.confirm_for_hull(a, false);
    }
}
