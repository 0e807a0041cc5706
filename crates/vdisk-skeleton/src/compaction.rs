//! Tracking of manually requested compactions
//!
//! A request names a set of partitions and, optionally, a sequence number
//! that must be durable before compaction may start. Each partition reports
//! back separately; the request finishes when the last one does.

use crate::messages::ReplyTo;
use std::collections::BTreeMap;
use tracing::error;
use vdisk_common::{HullDbMask, HullDbType, Lsn};

#[derive(Debug)]
struct CompactionRequest {
    /// Partitions that have not reported yet
    pending: HullDbMask,
    reply: Option<ReplyTo>,
    wait_lsn: Option<Lsn>,
    started: bool,
}

/// Outcome of one partition reporting
#[derive(Debug)]
pub enum CompactionProgress {
    Pending,
    /// Every partition finished; carries the reply to send, if any
    Done(Option<ReplyTo>),
}

#[derive(Debug, Default)]
pub struct VDiskCompactionState {
    next_id: u64,
    requests: BTreeMap<u64, CompactionRequest>,
}

impl VDiskCompactionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request; it starts once `wait_lsn` (if any) is durable
    pub fn setup(&mut self, mask: HullDbMask, reply: Option<ReplyTo>, wait_lsn: Option<Lsn>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.requests.insert(
            id,
            CompactionRequest {
                pending: mask,
                reply,
                wait_lsn,
                started: false,
            },
        );
        id
    }

    /// Requests that may start now that `confirmed_lsn` is durable.
    /// Each request is returned exactly once.
    pub fn ready(&mut self, confirmed_lsn: Lsn) -> Vec<(u64, HullDbMask)> {
        self.requests
            .iter_mut()
            .filter(|(_, req)| !req.started && req.wait_lsn.is_none_or(|lsn| lsn <= confirmed_lsn))
            .map(|(id, req)| {
                req.started = true;
                (*id, req.pending)
            })
            .collect()
    }

    /// Partition `db` of request `id` finished compacting
    ///
    /// A result for a request or partition that is not outstanding means
    /// the index engine and the skeleton disagree about compaction state,
    /// which panics.
    pub fn compacted(&mut self, id: u64, db: HullDbType) -> CompactionProgress {
        let Some(req) = self.requests.get_mut(&id).filter(|req| req.pending.contains(db)) else {
            error!(id, %db, "compaction result for unknown request");
            panic!("compaction result for unknown request {id} partition {db}");
        };
        req.pending = req.pending.without(db);
        if !req.pending.is_empty() {
            return CompactionProgress::Pending;
        }
        let reply = self.requests.remove(&id).and_then(|req| req.reply);
        CompactionProgress::Done(reply)
    }

    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Addr;

    #[test]
    fn test_sync_request_finishes_after_all_partitions() {
        let mut state = VDiskCompactionState::new();
        let (addr, _rx) = Addr::channel();
        let mask = HullDbMask::LOGO_BLOBS | HullDbMask::BARRIERS;
        let id = state.setup(mask, Some(ReplyTo::new(addr, 3)), None);

        assert_eq!(state.ready(0), vec![(id, mask)]);
        assert!(state.ready(0).is_empty());

        assert!(matches!(
            state.compacted(id, HullDbType::LogoBlobs),
            CompactionProgress::Pending
        ));
        match state.compacted(id, HullDbType::Barriers) {
            CompactionProgress::Done(Some(reply)) => assert_eq!(reply.cookie, 3),
            other => panic!("unexpected progress {other:?}"),
        }
        assert_eq!(state.outstanding(), 0);
    }

    #[test]
    fn test_waits_for_lsn() {
        let mut state = VDiskCompactionState::new();
        let id = state.setup(HullDbMask::ALL, None, Some(10));
        assert!(state.ready(9).is_empty());
        assert_eq!(state.ready(10), vec![(id, HullDbMask::ALL)]);
    }

    #[test]
    #[should_panic(expected = "unknown request")]
    fn test_unknown_request_panics() {
        let mut state = VDiskCompactionState::new();
        state.compacted(42, HullDbType::Blocks);
    }

    #[test]
    #[should_panic(expected = "unknown request")]
    fn test_partition_reported_twice_panics() {
        let mut state = VDiskCompactionState::new();
        let id = state.setup(HullDbMask::BLOCKS | HullDbMask::BARRIERS, None, None);
        state.compacted(id, HullDbType::Blocks);
        state.compacted(id, HullDbType::Blocks);
    }
}
