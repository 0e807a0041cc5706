//! In-memory index store
//!
//! Holds blobs, blocks and barriers in ordered maps behind an `Arc`, so a
//! snapshot is a cheap clone of the pointer and writers copy on write while
//! a snapshot is alive. Speculative state (blocks and barriers whose log
//! entry is not yet durable) lives beside the committed maps and takes part
//! in admission checks.
//!
//! Compaction is simulated: every applied update adds one unit of backlog to
//! the partitions it touches, and a partition whose backlog reaches its
//! fresh-segment limit is compacted as soon as its entries commit.

use crate::index::{
    AllocOutcome, Backlog, Barrier, BarrierKey, BlobValue, BlockCheck, CollectPoint, DbStat, GcCmd,
    HullCheckStatus, IndexSnapshot, IndexStore, IndexUpdate, SyncData,
};
use crate::lsn::LsnManager;
use crate::messages::{Addr, PendingReply, SkeletonMsg};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};
use vdisk_common::{HullDbType, LogoBlobId, Lsn, LsnSeg, ReplyStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BlockRec {
    generation: u32,
    issuer_guid: u64,
    lsn: Lsn,
}

#[derive(Clone, Debug, Default)]
struct IndexData {
    blobs: BTreeMap<LogoBlobId, BlobValue>,
    blocks: HashMap<u64, BlockRec>,
    barriers: BTreeMap<BarrierKey, Barrier>,
    /// Full blob ids carrying a keep flag
    keep: HashSet<LogoBlobId>,
    lsn: Lsn,
}

impl IndexData {
    fn apply_block(&mut self, tablet_id: u64, rec: BlockRec) {
        let current = self.blocks.entry(tablet_id).or_insert(rec);
        if rec.generation > current.generation {
            *current = rec;
        }
    }

    fn apply_gc(&mut self, cmd: &GcCmd, lsn: Lsn) {
        for id in &cmd.keep {
            self.keep.insert(*id);
        }
        for id in &cmd.do_not_keep {
            self.keep.remove(id);
        }
        let Some(collect) = cmd.collect else {
            return;
        };
        let key = cmd.barrier_key();
        let barrier = Barrier {
            record_generation: cmd.record_generation,
            per_generation_counter: cmd.per_generation_counter,
            collect,
            lsn,
        };
        let newer = self.barriers.get(&key).is_none_or(|old| {
            (old.record_generation, old.per_generation_counter)
                < (barrier.record_generation, barrier.per_generation_counter)
        });
        if newer {
            self.barriers.insert(key, barrier);
        }

        let keep = &self.keep;
        let before = self.blobs.len();
        self.blobs.retain(|id, _| {
            let collected = id.tablet_id == cmd.tablet_id
                && id.channel == cmd.channel
                && CollectPoint {
                    generation: id.generation,
                    step: id.step,
                } <= collect;
            !collected || (!cmd.hard && keep.contains(&id.full_id()))
        });
        trace!(
            tablet_id = cmd.tablet_id,
            channel = cmd.channel,
            collected = before - self.blobs.len(),
            "barrier applied"
        );
    }

    fn apply_sync_data(&mut self, data: &SyncData, seg: LsnSeg) {
        for id in &data.blobs {
            self.blobs.entry(*id).or_insert(BlobValue::Metadata);
        }
        for &(tablet_id, generation) in &data.blocks {
            self.apply_block(
                tablet_id,
                BlockRec {
                    generation,
                    issuer_guid: 0,
                    lsn: seg.last,
                },
            );
        }
        for cmd in &data.barriers {
            self.apply_gc(cmd, seg.last);
        }
    }
}

/// Point-in-time view of a [`MemIndexStore`]
#[derive(Debug)]
pub struct MemSnapshot {
    data: Arc<IndexData>,
}

impl IndexSnapshot for MemSnapshot {
    fn lsn(&self) -> Lsn {
        self.data.lsn
    }

    fn get(&self, id: &LogoBlobId) -> Option<BlobValue> {
        self.data.blobs.get(id).cloned()
    }

    fn range(&self, from: &LogoBlobId, to: &LogoBlobId, max: usize) -> Vec<(LogoBlobId, BlobValue)> {
        if from > to {
            return Vec::new();
        }
        let limit = if max == 0 { usize::MAX } else { max };
        self.data
            .blobs
            .range(*from..=*to)
            .take(limit)
            .map(|(id, value)| (*id, value.clone()))
            .collect()
    }

    fn blocked_generation(&self, tablet_id: u64) -> Option<u32> {
        self.data.blocks.get(&tablet_id).map(|b| b.generation)
    }

    fn barriers(&self, from: &BarrierKey, to: &BarrierKey) -> Vec<(BarrierKey, Barrier)> {
        if from > to {
            return Vec::new();
        }
        self.data.barriers.range(*from..=*to).map(|(k, b)| (*k, *b)).collect()
    }

    fn stat(&self) -> DbStat {
        DbStat {
            logo_blobs: self.data.blobs.len() as u64,
            blocks: self.data.blocks.len() as u64,
            barriers: self.data.barriers.len() as u64,
        }
    }
}

pub struct MemIndexStore {
    data: Arc<IndexData>,
    in_flight_blocks: HashMap<u64, BlockRec>,
    in_flight_barriers: HashMap<BarrierKey, Barrier>,
    postponed: BTreeMap<Lsn, Vec<PendingReply>>,
    committed: Lsn,
    backlog: Backlog,
    fresh_limit: Backlog,
    skeleton: Option<Addr<SkeletonMsg>>,
}

impl Default for MemIndexStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemIndexStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_fresh_limit(Backlog {
            logo_blobs: 128,
            blocks: 32,
            barriers: 32,
        })
    }

    /// Store whose partitions compact on their own once their backlog
    /// reaches `fresh_limit`
    #[must_use]
    pub fn with_fresh_limit(fresh_limit: Backlog) -> Self {
        Self {
            data: Arc::default(),
            in_flight_blocks: HashMap::new(),
            in_flight_barriers: HashMap::new(),
            postponed: BTreeMap::new(),
            committed: 0,
            backlog: Backlog::default(),
            fresh_limit,
            skeleton: None,
        }
    }

    /// Rebuild a store from durable updates in log order
    pub fn recover(mut self, updates: impl IntoIterator<Item = (IndexUpdate, LsnSeg)>) -> Self {
        for (update, seg) in updates {
            self.apply(update, seg);
        }
        self.committed = self.data.lsn;
        self.backlog = Backlog::default();
        self
    }

    fn data_mut(&mut self) -> &mut IndexData {
        Arc::make_mut(&mut self.data)
    }

    /// Newest block of a tablet, in flight or committed
    fn latest_block(&self, tablet_id: u64) -> Option<BlockRec> {
        let committed = self.data.blocks.get(&tablet_id).copied();
        let in_flight = self.in_flight_blocks.get(&tablet_id).copied();
        match (committed, in_flight) {
            (Some(c), Some(f)) if f.generation > c.generation => Some(f),
            (Some(c), _) => Some(c),
            (None, f) => f,
        }
    }

    /// Newest barrier under `key`, in flight or committed
    fn latest_barrier(&self, key: &BarrierKey) -> Option<Barrier> {
        self.in_flight_barriers
            .get(key)
            .or_else(|| self.data.barriers.get(key))
            .copied()
    }

    fn bump_backlog(&mut self, db: HullDbType) {
        match db {
            HullDbType::LogoBlobs => self.backlog.logo_blobs += 1,
            HullDbType::Blocks => self.backlog.blocks += 1,
            HullDbType::Barriers => self.backlog.barriers += 1,
        }
    }

    fn reset_backlog(&mut self, db: HullDbType) {
        match db {
            HullDbType::LogoBlobs => self.backlog.logo_blobs = 0,
            HullDbType::Blocks => self.backlog.blocks = 0,
            HullDbType::Barriers => self.backlog.barriers = 0,
        }
    }

    fn notify(&self, msg: SkeletonMsg) {
        if let Some(skeleton) = &self.skeleton {
            skeleton.send(msg);
        }
    }
}

impl IndexStore for MemIndexStore {
    fn start(&mut self, skeleton: Addr<SkeletonMsg>) {
        self.skeleton = Some(skeleton);
    }

    fn check_logo_blob(&self, id: &LogoBlobId, ignore_block: bool) -> HullCheckStatus {
        if ignore_block {
            return HullCheckStatus::ok();
        }
        if let Some(block) = self.data.blocks.get(&id.tablet_id)
            && id.generation <= block.generation
        {
            return HullCheckStatus::error(ReplyStatus::Blocked, "blocked");
        }
        if let Some(block) = self.in_flight_blocks.get(&id.tablet_id)
            && id.generation <= block.generation
        {
            return HullCheckStatus::postponed(ReplyStatus::Blocked, "blocked", block.lsn);
        }
        HullCheckStatus::ok()
    }

    fn check_block_and_alloc_lsn(
        &mut self,
        lsn: &mut LsnManager,
        tablet_id: u64,
        generation: u32,
        issuer_guid: u64,
    ) -> BlockCheck {
        if let Some(current) = self.latest_block(tablet_id) {
            let actual_generation = Some(current.generation);
            if generation < current.generation {
                return BlockCheck {
                    outcome: AllocOutcome::Rejected(HullCheckStatus::error(
                        ReplyStatus::Race,
                        "block race detected",
                    )),
                    actual_generation,
                };
            }
            if generation == current.generation {
                let status = if issuer_guid != 0 && issuer_guid == current.issuer_guid {
                    HullCheckStatus::postponed(ReplyStatus::Ok, "", current.lsn)
                } else {
                    HullCheckStatus::error(ReplyStatus::Already, "already blocked")
                };
                return BlockCheck {
                    outcome: AllocOutcome::Rejected(status),
                    actual_generation,
                };
            }
        }

        let seg = lsn.alloc_for_hull_and_sync_log(1);
        self.in_flight_blocks.insert(
            tablet_id,
            BlockRec {
                generation,
                issuer_guid,
                lsn: seg.last,
            },
        );
        BlockCheck {
            outcome: AllocOutcome::Allocated(seg),
            actual_generation: Some(generation),
        }
    }

    fn check_gc_and_alloc_lsn(&mut self, lsn: &mut LsnManager, cmd: &GcCmd) -> AllocOutcome {
        if let Some(block) = self.latest_block(cmd.tablet_id)
            && cmd.record_generation <= block.generation
        {
            return AllocOutcome::Rejected(HullCheckStatus::error(ReplyStatus::Blocked, "tablet is blocked"));
        }

        if let Some(collect) = cmd.collect
            && let Some(prior) = self.latest_barrier(&cmd.barrier_key())
        {
            let incoming = (cmd.record_generation, cmd.per_generation_counter);
            let stored = (prior.record_generation, prior.per_generation_counter);
            if incoming < stored {
                return AllocOutcome::Rejected(HullCheckStatus::error(
                    ReplyStatus::Race,
                    "barrier record generation is stale",
                ));
            }
            if incoming == stored {
                return AllocOutcome::Rejected(if collect == prior.collect {
                    HullCheckStatus::postponed(ReplyStatus::Ok, "", prior.lsn)
                } else {
                    HullCheckStatus::error(ReplyStatus::Error, "barrier record mismatch")
                });
            }
            if collect < prior.collect {
                return AllocOutcome::Rejected(HullCheckStatus::error(
                    ReplyStatus::Error,
                    "collect point moves backwards",
                ));
            }
        }

        let seg = lsn.alloc_for_hull_and_sync_log(cmd.lsn_count());
        if let Some(collect) = cmd.collect {
            self.in_flight_barriers.insert(
                cmd.barrier_key(),
                Barrier {
                    record_generation: cmd.record_generation,
                    per_generation_counter: cmd.per_generation_counter,
                    collect,
                    lsn: seg.last,
                },
            );
        }
        AllocOutcome::Allocated(seg)
    }

    fn allocate_lsn_for_sync_data(&mut self, lsn: &mut LsnManager, data: &SyncData) -> LsnSeg {
        lsn.alloc_for_hull(data.record_count().max(1))
    }

    fn allocate_lsn_for_phantoms(&mut self, lsn: &mut LsnManager, ids: &[LogoBlobId]) -> LsnSeg {
        lsn.alloc_for_hull_and_sync_log((ids.len() as u64).max(1))
    }

    fn blocked_generation(&self, tablet_id: u64) -> Option<u32> {
        self.data.blocks.get(&tablet_id).map(|b| b.generation)
    }

    fn take_snapshot(&self) -> Arc<dyn IndexSnapshot> {
        Arc::new(MemSnapshot {
            data: Arc::clone(&self.data),
        })
    }

    fn postpone_reply_until_committed(&mut self, reply: PendingReply, lsn: Lsn) {
        if lsn <= self.committed {
            reply.send();
        } else {
            self.postponed.entry(lsn).or_default().push(reply);
        }
    }

    fn apply(&mut self, update: IndexUpdate, seg: LsnSeg) {
        for db in update.db_types() {
            self.bump_backlog(*db);
        }
        match update {
            IndexUpdate::LogoBlob { id, data } => {
                self.data_mut().blobs.insert(id, BlobValue::Inline(data));
            }
            IndexUpdate::HugeBlob { id, placement } => {
                self.data_mut().blobs.insert(id, BlobValue::Huge(placement));
            }
            IndexUpdate::Block {
                tablet_id,
                generation,
                issuer_guid,
            } => {
                let rec = BlockRec {
                    generation,
                    issuer_guid,
                    lsn: seg.last,
                };
                self.data_mut().apply_block(tablet_id, rec);
                if self.in_flight_blocks.get(&tablet_id).is_some_and(|b| b.lsn == seg.last) {
                    self.in_flight_blocks.remove(&tablet_id);
                }
            }
            IndexUpdate::CollectGarbage(cmd) => {
                self.data_mut().apply_gc(&cmd, seg.last);
                let key = cmd.barrier_key();
                if self.in_flight_barriers.get(&key).is_some_and(|b| b.lsn == seg.last) {
                    self.in_flight_barriers.remove(&key);
                }
            }
            IndexUpdate::SyncData(data) => self.data_mut().apply_sync_data(&data, seg),
            IndexUpdate::AnubisOsirisPut { id } => {
                self.data_mut().blobs.entry(id).or_insert(BlobValue::Metadata);
            }
            IndexUpdate::Phantoms { ids } => {
                let data = self.data_mut();
                for id in &ids {
                    data.blobs.remove(id);
                }
            }
            IndexUpdate::HandoffDel { id } => {
                self.data_mut().blobs.remove(&id);
            }
        }
        let data = self.data_mut();
        data.lsn = data.lsn.max(seg.last);
    }

    fn lsn_committed(&mut self, lsn: Lsn) {
        if lsn > self.committed {
            self.committed = lsn;
            let later = self.postponed.split_off(&(lsn + 1));
            let ready = std::mem::replace(&mut self.postponed, later);
            for reply in ready.into_values().flatten() {
                reply.send();
            }
        }

        for db in HullDbType::ALL {
            if self.backlog.get(db) >= self.fresh_limit.get(db) {
                debug!(%db, backlog = self.backlog.get(db), "fresh segment compacted");
                self.reset_backlog(db);
                self.notify(SkeletonMsg::CompactionFinished);
            }
        }
    }

    fn backlog(&self) -> Backlog {
        self.backlog
    }

    fn compact(&mut self, db: HullDbType, request_id: u64) {
        debug!(%db, request_id, backlog = self.backlog.get(db), "compacting");
        self.reset_backlog(db);
        self.notify(SkeletonMsg::HullCompactResult { db, request_id });
        self.notify(SkeletonMsg::CompactionFinished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Reply, ReplyTo, Response};
    use bytes::Bytes;
    use vdisk_common::DiskPart;

    fn blob(tablet: u64, generation: u32, step: u32) -> LogoBlobId {
        LogoBlobId::new(tablet, generation, step, 0, 4, 0).with_part(1)
    }

    fn put(index: &mut MemIndexStore, lsn: &mut LsnManager, id: LogoBlobId) {
        let seg = lsn.alloc_for_hull_and_sync_log(1);
        lsn.confirm_for_hull(seg, true);
        index.apply(
            IndexUpdate::LogoBlob {
                id,
                data: Bytes::from_static(b"data"),
            },
            seg,
        );
        index.lsn_committed(lsn.confirmed_lsn());
    }

    fn block(index: &mut MemIndexStore, lsn: &mut LsnManager, tablet: u64, generation: u32, issuer: u64) -> BlockCheck {
        index.check_block_and_alloc_lsn(lsn, tablet, generation, issuer)
    }

    fn commit(index: &mut MemIndexStore, lsn: &mut LsnManager, seg: LsnSeg, update: IndexUpdate) {
        lsn.confirm_for_hull(seg, true);
        index.apply(update, seg);
        index.lsn_committed(lsn.confirmed_lsn());
    }

    fn gc(tablet: u64, generation: u32, counter: u32, collect: Option<(u32, u32)>) -> GcCmd {
        GcCmd {
            tablet_id: tablet,
            record_generation: generation,
            per_generation_counter: counter,
            channel: 0,
            collect: collect.map(|(generation, step)| CollectPoint { generation, step }),
            hard: false,
            keep: Vec::new(),
            do_not_keep: Vec::new(),
        }
    }

    #[test]
    fn test_snapshot_isolation() {
        let mut index = MemIndexStore::new();
        let mut lsn = LsnManager::new(0);
        put(&mut index, &mut lsn, blob(1, 1, 1));
        let snapshot = index.take_snapshot();
        put(&mut index, &mut lsn, blob(1, 1, 2));

        assert!(snapshot.get(&blob(1, 1, 2)).is_none());
        assert_eq!(snapshot.stat().logo_blobs, 1);
        assert_eq!(index.take_snapshot().stat().logo_blobs, 2);
        assert_eq!(index.take_snapshot().lsn(), 2);
    }

    #[test]
    fn test_block_race_and_already() {
        let mut index = MemIndexStore::new();
        let mut lsn = LsnManager::new(0);

        let first = block(&mut index, &mut lsn, 7, 3, 11);
        let AllocOutcome::Allocated(seg) = first.outcome else {
            panic!("first block rejected");
        };

        let stale = block(&mut index, &mut lsn, 7, 2, 11);
        assert_eq!(stale.actual_generation, Some(3));
        assert!(matches!(stale.outcome, AllocOutcome::Rejected(ref s) if s.status == ReplyStatus::Race));

        let other_issuer = block(&mut index, &mut lsn, 7, 3, 12);
        assert!(matches!(other_issuer.outcome, AllocOutcome::Rejected(ref s) if s.status == ReplyStatus::Already));

        let same_issuer = block(&mut index, &mut lsn, 7, 3, 11);
        assert_eq!(
            same_issuer.outcome,
            AllocOutcome::Rejected(HullCheckStatus::postponed(ReplyStatus::Ok, "", seg.last))
        );

        commit(
            &mut index,
            &mut lsn,
            seg,
            IndexUpdate::Block {
                tablet_id: 7,
                generation: 3,
                issuer_guid: 11,
            },
        );
        assert_eq!(index.blocked_generation(7), Some(3));
    }

    #[test]
    fn test_put_blocked_by_in_flight_block() {
        let mut index = MemIndexStore::new();
        let mut lsn = LsnManager::new(0);
        let check = block(&mut index, &mut lsn, 7, 3, 0);
        let AllocOutcome::Allocated(seg) = check.outcome else {
            panic!("block rejected");
        };

        let status = index.check_logo_blob(&blob(7, 2, 1), false);
        assert_eq!(status, HullCheckStatus::postponed(ReplyStatus::Blocked, "blocked", seg.last));
        assert!(index.check_logo_blob(&blob(7, 2, 1), true).proceeds());
        assert!(index.check_logo_blob(&blob(7, 4, 1), false).proceeds());

        commit(
            &mut index,
            &mut lsn,
            seg,
            IndexUpdate::Block {
                tablet_id: 7,
                generation: 3,
                issuer_guid: 0,
            },
        );
        let status = index.check_logo_blob(&blob(7, 3, 1), false);
        assert_eq!(status.status, ReplyStatus::Blocked);
        assert!(!status.is_postponed());
    }

    #[test]
    fn test_gc_admission() {
        let mut index = MemIndexStore::new();
        let mut lsn = LsnManager::new(0);
        let cmd = gc(3, 2, 1, Some((2, 10)));
        let AllocOutcome::Allocated(seg) = index.check_gc_and_alloc_lsn(&mut lsn, &cmd) else {
            panic!("gc rejected");
        };

        // exact duplicate waits for the original
        assert_eq!(
            index.check_gc_and_alloc_lsn(&mut lsn, &cmd),
            AllocOutcome::Rejected(HullCheckStatus::postponed(ReplyStatus::Ok, "", seg.last))
        );
        let stale = gc(3, 1, 5, Some((1, 1)));
        assert!(matches!(
            index.check_gc_and_alloc_lsn(&mut lsn, &stale),
            AllocOutcome::Rejected(ref s) if s.status == ReplyStatus::Race
        ));
        let backwards = gc(3, 2, 2, Some((2, 5)));
        assert!(matches!(
            index.check_gc_and_alloc_lsn(&mut lsn, &backwards),
            AllocOutcome::Rejected(ref s) if s.status == ReplyStatus::Error
        ));
        let mismatch = gc(3, 2, 1, Some((2, 11)));
        assert!(matches!(
            index.check_gc_and_alloc_lsn(&mut lsn, &mismatch),
            AllocOutcome::Rejected(ref s) if s.status == ReplyStatus::Error
        ));

        commit(&mut index, &mut lsn, seg, IndexUpdate::CollectGarbage(cmd));
        let blocked_seg = match block(&mut index, &mut lsn, 3, 5, 0).outcome {
            AllocOutcome::Allocated(seg) => seg,
            AllocOutcome::Rejected(status) => panic!("block rejected: {status:?}"),
        };
        assert!(matches!(
            index.check_gc_and_alloc_lsn(&mut lsn, &gc(3, 4, 1, None)),
            AllocOutcome::Rejected(ref s) if s.status == ReplyStatus::Blocked
        ));
        assert!(blocked_seg.last > seg.last);
    }

    #[test]
    fn test_barrier_collects_unkept_blobs() {
        let mut index = MemIndexStore::new();
        let mut lsn = LsnManager::new(0);
        for step in 1..=4 {
            put(&mut index, &mut lsn, blob(5, 1, step));
        }

        let mut keep = gc(5, 1, 1, None);
        keep.keep = vec![blob(5, 1, 2).full_id()];
        let AllocOutcome::Allocated(seg) = index.check_gc_and_alloc_lsn(&mut lsn, &keep) else {
            panic!("keep rejected");
        };
        assert_eq!(seg.count(), 2);
        commit(&mut index, &mut lsn, seg, IndexUpdate::CollectGarbage(keep));

        let barrier = gc(5, 1, 2, Some((1, 3)));
        let AllocOutcome::Allocated(seg) = index.check_gc_and_alloc_lsn(&mut lsn, &barrier) else {
            panic!("barrier rejected");
        };
        commit(&mut index, &mut lsn, seg, IndexUpdate::CollectGarbage(barrier));

        let snapshot = index.take_snapshot();
        assert!(snapshot.get(&blob(5, 1, 1)).is_none());
        assert!(snapshot.get(&blob(5, 1, 2)).is_some());
        assert!(snapshot.get(&blob(5, 1, 3)).is_none());
        assert!(snapshot.get(&blob(5, 1, 4)).is_some());

        let key = BarrierKey {
            tablet_id: 5,
            channel: 0,
            hard: false,
        };
        let barriers = snapshot.barriers(&key, &key);
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].1.collect, CollectPoint { generation: 1, step: 3 });
    }

    #[test]
    fn test_postponed_reply_released_on_commit() {
        let mut index = MemIndexStore::new();
        let (addr, mut rx) = Addr::<Reply>::channel();
        let reply = PendingReply {
            to: ReplyTo::new(addr, 1),
            response: Response::internal(crate::messages::MessageKind::Block, ReplyStatus::Ok, ""),
        };
        index.postpone_reply_until_committed(reply.clone(), 5);
        index.lsn_committed(4);
        assert!(rx.try_recv().is_err());
        index.lsn_committed(5);
        assert_eq!(rx.try_recv().unwrap().cookie, 1);

        // already durable goes out at once
        index.postpone_reply_until_committed(reply, 3);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_fresh_segment_compaction_notifies() {
        let mut index = MemIndexStore::with_fresh_limit(Backlog {
            logo_blobs: 2,
            blocks: 100,
            barriers: 100,
        });
        let (skeleton, mut rx) = Addr::channel();
        index.start(skeleton);
        let mut lsn = LsnManager::new(0);

        put(&mut index, &mut lsn, blob(1, 1, 1));
        assert_eq!(index.backlog().logo_blobs, 1);
        put(&mut index, &mut lsn, blob(1, 1, 2));
        assert_eq!(index.backlog().logo_blobs, 0);
        assert!(matches!(rx.try_recv(), Ok(SkeletonMsg::CompactionFinished)));

        put(&mut index, &mut lsn, blob(1, 1, 3));
        index.compact(HullDbType::LogoBlobs, 8);
        assert_eq!(index.backlog().logo_blobs, 0);
        assert!(matches!(
            rx.try_recv(),
            Ok(SkeletonMsg::HullCompactResult {
                db: HullDbType::LogoBlobs,
                request_id: 8
            })
        ));
    }

    #[test]
    fn test_recover_and_range() {
        let updates = vec![
            (
                IndexUpdate::LogoBlob {
                    id: blob(2, 1, 1),
                    data: Bytes::from_static(b"aaaa"),
                },
                LsnSeg::point(1),
            ),
            (
                IndexUpdate::HugeBlob {
                    id: blob(2, 1, 2),
                    placement: DiskPart::new(0, 0, 4),
                },
                LsnSeg::point(2),
            ),
            (IndexUpdate::HandoffDel { id: blob(2, 1, 1) }, LsnSeg::point(3)),
        ];
        let index = MemIndexStore::new().recover(updates);
        assert_eq!(index.backlog(), Backlog::default());

        let snapshot = index.take_snapshot();
        assert_eq!(snapshot.lsn(), 3);
        let found = snapshot.range(&blob(2, 0, 0), &blob(2, 9, 9), 0);
        assert_eq!(found.len(), 1);
        assert!(matches!(found[0].1, BlobValue::Huge(_)));
    }
}
