//! Index store interface
//!
//! The index store holds the actual records (blobs, blocks, barriers) and is
//! the authority on admissibility: whether a put is blocked, whether a block
//! or garbage-collect command is stale. The skeleton only drives it; the
//! in-memory implementation lives in [`crate::mem_index`].

use crate::lsn::LsnManager;
use crate::messages::{Addr, CutLog, PendingReply, SkeletonMsg};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use vdisk_common::{DiskPart, HullDbType, LogoBlobId, Lsn, LsnSeg, ReplyStatus};

/// Collect point of a barrier: everything at or below `(generation, step)`
/// may be deleted
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectPoint {
    pub generation: u32,
    pub step: u32,
}

/// Garbage-collect command from one tablet channel
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcCmd {
    pub tablet_id: u64,
    pub record_generation: u32,
    pub per_generation_counter: u32,
    pub channel: u8,
    pub collect: Option<CollectPoint>,
    pub hard: bool,
    pub keep: Vec<LogoBlobId>,
    pub do_not_keep: Vec<LogoBlobId>,
}

impl GcCmd {
    /// Number of sequence numbers the command consumes
    #[must_use]
    pub fn lsn_count(&self) -> u64 {
        1 + self.keep.len() as u64 + self.do_not_keep.len() as u64
    }

    #[must_use]
    pub const fn barrier_key(&self) -> BarrierKey {
        BarrierKey {
            tablet_id: self.tablet_id,
            channel: self.channel,
            hard: self.hard,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BarrierKey {
    pub tablet_id: u64,
    pub channel: u8,
    pub hard: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barrier {
    pub record_generation: u32,
    pub per_generation_counter: u32,
    pub collect: CollectPoint,
    /// Sequence number of the command that set the barrier
    pub lsn: Lsn,
}

/// Records delivered by the synchronizer from a peer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncData {
    pub blobs: Vec<LogoBlobId>,
    /// `(tablet_id, generation)` pairs
    pub blocks: Vec<(u64, u32)>,
    pub barriers: Vec<GcCmd>,
}

impl SyncData {
    #[must_use]
    pub fn record_count(&self) -> u64 {
        (self.blobs.len() + self.blocks.len() + self.barriers.len()) as u64
    }
}

/// A durable state change, as written to the recovery log and applied to the
/// index once durable
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexUpdate {
    LogoBlob { id: LogoBlobId, data: Bytes },
    HugeBlob { id: LogoBlobId, placement: DiskPart },
    Block { tablet_id: u64, generation: u32, issuer_guid: u64 },
    CollectGarbage(GcCmd),
    SyncData(SyncData),
    AnubisOsirisPut { id: LogoBlobId },
    Phantoms { ids: Vec<LogoBlobId> },
    HandoffDel { id: LogoBlobId },
}

impl IndexUpdate {
    /// Partitions touched by the update
    #[must_use]
    pub fn db_types(&self) -> &'static [HullDbType] {
        match self {
            Self::LogoBlob { .. }
            | Self::HugeBlob { .. }
            | Self::AnubisOsirisPut { .. }
            | Self::Phantoms { .. }
            | Self::HandoffDel { .. } => &[HullDbType::LogoBlobs],
            Self::Block { .. } => &[HullDbType::Blocks],
            Self::CollectGarbage(_) => &[HullDbType::LogoBlobs, HullDbType::Barriers],
            Self::SyncData(_) => &HullDbType::ALL,
        }
    }
}

/// Stored value of a blob part
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlobValue {
    Inline(Bytes),
    Huge(DiskPart),
    /// Known to exist, payload held elsewhere (synced or repaired)
    Metadata,
}

/// Outcome of an admissibility check
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HullCheckStatus {
    pub status: ReplyStatus,
    pub reason: String,
    /// Reply only once this sequence number is durable
    pub postponed_until: Option<Lsn>,
}

impl HullCheckStatus {
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: ReplyStatus::Ok,
            reason: String::new(),
            postponed_until: None,
        }
    }

    #[must_use]
    pub fn error(status: ReplyStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            postponed_until: None,
        }
    }

    #[must_use]
    pub fn postponed(status: ReplyStatus, reason: impl Into<String>, lsn: Lsn) -> Self {
        Self {
            status,
            reason: reason.into(),
            postponed_until: Some(lsn),
        }
    }

    /// OK and nothing to wait for: the write proceeds
    #[must_use]
    pub const fn proceeds(&self) -> bool {
        self.status.is_ok() && self.postponed_until.is_none()
    }

    #[must_use]
    pub const fn is_postponed(&self) -> bool {
        self.postponed_until.is_some()
    }
}

/// Outcome of a check that allocates sequence numbers when it admits
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocOutcome {
    Allocated(LsnSeg),
    Rejected(HullCheckStatus),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockCheck {
    pub outcome: AllocOutcome,
    /// Generation the tablet is blocked at after the check
    pub actual_generation: Option<u32>,
}

/// Uncompacted work per partition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Backlog {
    pub logo_blobs: u64,
    pub blocks: u64,
    pub barriers: u64,
}

impl Backlog {
    #[must_use]
    pub const fn get(&self, db: HullDbType) -> u64 {
        match db {
            HullDbType::LogoBlobs => self.logo_blobs,
            HullDbType::Blocks => self.blocks,
            HullDbType::Barriers => self.barriers,
        }
    }
}

/// Record counts per partition
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DbStat {
    pub logo_blobs: u64,
    pub blocks: u64,
    pub barriers: u64,
}

impl DbStat {
    #[must_use]
    pub const fn get(&self, db: HullDbType) -> u64 {
        match db {
            HullDbType::LogoBlobs => self.logo_blobs,
            HullDbType::Blocks => self.blocks,
            HullDbType::Barriers => self.barriers,
        }
    }
}

/// Immutable point-in-time view used by read-path queries
pub trait IndexSnapshot: Send + Sync + fmt::Debug {
    /// Sequence number the view is consistent at
    fn lsn(&self) -> Lsn;

    fn get(&self, id: &LogoBlobId) -> Option<BlobValue>;

    /// Parts in `[from, to]`, at most `max` of them (0 means unlimited)
    fn range(&self, from: &LogoBlobId, to: &LogoBlobId, max: usize) -> Vec<(LogoBlobId, BlobValue)>;

    fn blocked_generation(&self, tablet_id: u64) -> Option<u32>;

    fn barriers(&self, from: &BarrierKey, to: &BarrierKey) -> Vec<(BarrierKey, Barrier)>;

    fn stat(&self) -> DbStat;
}

/// The log-structured index engine as seen by the skeleton
///
/// Checks that allocate take the [`LsnManager`] so a speculative update and
/// its sequence number are reserved together.
pub trait IndexStore: Send {
    /// Called once by the skeleton after local recovery; completions
    /// (compaction results) are sent to `skeleton`
    fn start(&mut self, skeleton: Addr<SkeletonMsg>);

    /// Pre-write admissibility of a blob part
    fn check_logo_blob(&self, id: &LogoBlobId, ignore_block: bool) -> HullCheckStatus;

    fn check_block_and_alloc_lsn(
        &mut self,
        lsn: &mut LsnManager,
        tablet_id: u64,
        generation: u32,
        issuer_guid: u64,
    ) -> BlockCheck;

    fn check_gc_and_alloc_lsn(&mut self, lsn: &mut LsnManager, cmd: &GcCmd) -> AllocOutcome;

    fn allocate_lsn_for_sync_data(&mut self, lsn: &mut LsnManager, data: &SyncData) -> LsnSeg;

    fn allocate_lsn_for_phantoms(&mut self, lsn: &mut LsnManager, ids: &[LogoBlobId]) -> LsnSeg;

    /// Committed blocked generation of a tablet
    fn blocked_generation(&self, tablet_id: u64) -> Option<u32>;

    fn take_snapshot(&self) -> Arc<dyn IndexSnapshot>;

    /// Hold `reply` until `lsn` is durable; sends at once if it already is
    fn postpone_reply_until_committed(&mut self, reply: PendingReply, lsn: Lsn);

    /// Apply a durable update
    fn apply(&mut self, update: IndexUpdate, seg: LsnSeg);

    /// Everything up to `lsn` is durable
    fn lsn_committed(&mut self, lsn: Lsn);

    fn backlog(&self) -> Backlog;

    /// Start compacting `db`; reports `HullCompactResult` with `request_id`
    /// and `CompactionFinished` to the skeleton when done
    fn compact(&mut self, db: HullDbType, request_id: u64);

    fn cut_log(&mut self, _cut: &CutLog) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gc_lsn_count() {
        let id = LogoBlobId::new(1, 1, 1, 0, 10, 0);
        let cmd = GcCmd {
            tablet_id: 1,
            record_generation: 2,
            per_generation_counter: 1,
            channel: 0,
            collect: None,
            hard: false,
            keep: vec![id, id],
            do_not_keep: vec![id],
        };
        assert_eq!(cmd.lsn_count(), 4);
        assert_eq!(
            cmd.barrier_key(),
            BarrierKey {
                tablet_id: 1,
                channel: 0,
                hard: false
            }
        );
    }

    #[test]
    fn test_check_status() {
        assert!(HullCheckStatus::ok().proceeds());
        let postponed = HullCheckStatus::postponed(ReplyStatus::Ok, "", 12);
        assert!(postponed.is_postponed());
        assert!(!postponed.proceeds());
        assert!(!HullCheckStatus::error(ReplyStatus::Blocked, "blocked").proceeds());
    }

    #[test]
    fn test_update_db_types() {
        let update = IndexUpdate::Block {
            tablet_id: 1,
            generation: 1,
            issuer_guid: 0,
        };
        assert_eq!(update.db_types(), &[HullDbType::Blocks]);
        assert_eq!(IndexUpdate::SyncData(SyncData::default()).db_types().len(), 3);
    }

    #[test]
    fn test_update_serde() {
        let update = IndexUpdate::LogoBlob {
            id: LogoBlobId::new(3, 1, 2, 0, 4, 0).with_part(1),
            data: Bytes::from_static(b"data"),
        };
        let encoded = bincode::serialize(&update).unwrap();
        let decoded: IndexUpdate = bincode::deserialize(&encoded).unwrap();
        assert_eq!(decoded, update);
    }
}
