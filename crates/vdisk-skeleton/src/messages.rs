//! Messages exchanged by the skeleton, its clients and its collaborators
//!
//! Every actor is addressed through an [`Addr`], a cloneable handle on its
//! unbounded mailbox. Requests carry a [`ReplyTo`] naming where the single
//! terminal reply goes; nothing else crosses actor boundaries.

use crate::index::{Barrier, BarrierKey, DbStat, GcCmd, IndexSnapshot, IndexStore, IndexUpdate, SyncData};
use crate::oos::OutOfSpaceState;
use crate::overload::SchedulerWeights;
use crate::vault::VaultHandle;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;
use vdisk_common::{
    DiskPart, GroupInfo, HullDbMask, HullDbType, LogoBlobId, Lsn, LsnSeg, OutOfSpaceFlags, ReplyStatus,
    VDiskId, VDiskStatus,
};

/// Address of an actor mailbox
pub struct Addr<M>(mpsc::UnboundedSender<M>);

impl<M> Addr<M> {
    /// Create a mailbox and the address pointing at it
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<M>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Deliver `msg`. Returns false when the receiving actor is gone.
    pub fn send(&self, msg: M) -> bool {
        self.0.send(msg).is_ok()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    #[must_use]
    pub fn same_mailbox(&self, other: &Self) -> bool {
        self.0.same_channel(&other.0)
    }
}

impl<M> Clone for Addr<M> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<M> fmt::Debug for Addr<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Addr").field("closed", &self.is_closed()).finish()
    }
}

/// A reply as delivered to the requester's mailbox
#[derive(Clone, Debug)]
pub struct Reply {
    pub cookie: u64,
    pub response: Response,
}

/// Destination of the terminal reply to one request
#[derive(Clone, Debug)]
pub struct ReplyTo {
    pub addr: Addr<Reply>,
    pub cookie: u64,
}

impl ReplyTo {
    #[must_use]
    pub const fn new(addr: Addr<Reply>, cookie: u64) -> Self {
        Self { addr, cookie }
    }

    pub fn send(&self, response: Response) {
        let cookie = self.cookie;
        if !self.addr.send(Reply { cookie, response }) {
            trace!(cookie, "reply dropped, requester is gone");
        }
    }
}

/// A reply held back until a sequence number is durable
#[derive(Clone, Debug)]
pub struct PendingReply {
    pub to: ReplyTo,
    pub response: Response,
}

impl PendingReply {
    pub fn send(self) {
        self.to.send(self.response);
    }
}

// ---------------------------------------------------------------------------
// Client protocol
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PutRequest {
    pub vdisk_id: VDiskId,
    pub id: LogoBlobId,
    pub data: Bytes,
    pub ignore_block: bool,
}

#[derive(Clone, Debug)]
pub struct MultiPutItem {
    pub id: LogoBlobId,
    pub data: Bytes,
}

#[derive(Clone, Debug)]
pub struct MultiPutRequest {
    pub vdisk_id: VDiskId,
    pub items: Vec<MultiPutItem>,
    pub ignore_block: bool,
}

/// Point read of one blob part; `size == 0` reads to the end
#[derive(Clone, Copy, Debug)]
pub struct ExtremeQuery {
    pub id: LogoBlobId,
    pub shift: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct RangeQuery {
    pub from: LogoBlobId,
    pub to: LogoBlobId,
    pub max_results: u32,
}

/// Read request; exactly one of `extreme` and `range` must be set
#[derive(Clone, Debug, Default)]
pub struct GetRequest {
    pub vdisk_id: VDiskId,
    pub extreme: Vec<ExtremeQuery>,
    pub range: Option<RangeQuery>,
    pub index_only: bool,
    /// Report the blocked generation of `reader_tablet` along with the data
    pub acquire_blocked_generation: bool,
    pub reader_tablet: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
pub struct BlockRequest {
    pub vdisk_id: VDiskId,
    pub tablet_id: u64,
    pub generation: u32,
    pub issuer_guid: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct GetBlockRequest {
    pub vdisk_id: VDiskId,
    pub tablet_id: u64,
}

#[derive(Clone, Debug)]
pub struct CollectGarbageRequest {
    pub vdisk_id: VDiskId,
    pub cmd: GcCmd,
}

#[derive(Clone, Copy, Debug)]
pub struct GetBarrierRequest {
    pub vdisk_id: VDiskId,
    pub from: BarrierKey,
    pub to: BarrierKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactMode {
    /// Reply once every requested partition has compacted
    Sync,
    /// Reply as soon as compaction has started
    Async,
}

#[derive(Clone, Copy, Debug)]
pub struct CompactRequest {
    pub vdisk_id: VDiskId,
    pub mask: HullDbMask,
    pub mode: CompactMode,
}

#[derive(Clone, Copy, Debug)]
pub struct StatusRequest {
    pub vdisk_id: VDiskId,
}

#[derive(Clone, Copy, Debug)]
pub struct DbStatRequest {
    pub vdisk_id: VDiskId,
    pub db: HullDbType,
}

#[derive(Clone, Copy, Debug)]
pub struct PatchStart {
    pub vdisk_id: VDiskId,
    pub original_id: LogoBlobId,
    pub patched_id: LogoBlobId,
}

#[derive(Clone, Debug)]
pub struct PatchDiff {
    pub vdisk_id: VDiskId,
    pub original_id: LogoBlobId,
    pub offset: u32,
    pub data: Bytes,
    pub is_final: bool,
}

/// A request arriving over the distributed protocol
#[derive(Clone, Debug)]
pub enum ClientRequest {
    Put(PutRequest),
    MultiPut(MultiPutRequest),
    Get(GetRequest),
    Block(BlockRequest),
    GetBlock(GetBlockRequest),
    CollectGarbage(CollectGarbageRequest),
    GetBarrier(GetBarrierRequest),
    Compact(CompactRequest),
    Status(StatusRequest),
    DbStat(DbStatRequest),
    PatchStart(PatchStart),
    PatchDiff(PatchDiff),
}

impl ClientRequest {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Put(_) => MessageKind::Put,
            Self::MultiPut(_) => MessageKind::MultiPut,
            Self::Get(_) => MessageKind::Get,
            Self::Block(_) => MessageKind::Block,
            Self::GetBlock(_) => MessageKind::GetBlock,
            Self::CollectGarbage(_) => MessageKind::CollectGarbage,
            Self::GetBarrier(_) => MessageKind::GetBarrier,
            Self::Compact(_) => MessageKind::Compact,
            Self::Status(_) => MessageKind::Status,
            Self::DbStat(_) => MessageKind::DbStat,
            Self::PatchStart(_) => MessageKind::PatchStart,
            Self::PatchDiff(_) => MessageKind::PatchDiff,
        }
    }

    #[must_use]
    pub const fn vdisk_id(&self) -> VDiskId {
        match self {
            Self::Put(r) => r.vdisk_id,
            Self::MultiPut(r) => r.vdisk_id,
            Self::Get(r) => r.vdisk_id,
            Self::Block(r) => r.vdisk_id,
            Self::GetBlock(r) => r.vdisk_id,
            Self::CollectGarbage(r) => r.vdisk_id,
            Self::GetBarrier(r) => r.vdisk_id,
            Self::Compact(r) => r.vdisk_id,
            Self::Status(r) => r.vdisk_id,
            Self::DbStat(r) => r.vdisk_id,
            Self::PatchStart(r) => r.vdisk_id,
            Self::PatchDiff(r) => r.vdisk_id,
        }
    }

    /// Build the terminal reply for a request that ends with `status`
    /// without being processed
    #[must_use]
    pub fn error_response(&self, status: ReplyStatus, reason: impl Into<String>) -> Response {
        let reason = reason.into();
        match self {
            Self::Put(r) => Response::Put(PutResult {
                status,
                reason,
                id: r.id,
                oos: OutOfSpaceFlags::NONE,
            }),
            Self::MultiPut(r) => Response::MultiPut(MultiPutResult {
                status,
                reason,
                items: r
                    .items
                    .iter()
                    .map(|item| MultiPutItemStatus { id: item.id, status })
                    .collect(),
            }),
            Self::Get(r) => Response::Get(GetResult {
                status,
                reason,
                results: r
                    .extreme
                    .iter()
                    .map(|q| QueryResult::status_only(q.id, status))
                    .collect(),
                blocked_generation: None,
            }),
            Self::Block(r) => Response::Block(BlockResult {
                status,
                reason,
                tablet_id: r.tablet_id,
                actual_generation: None,
            }),
            Self::GetBlock(r) => Response::GetBlock(GetBlockResult {
                status,
                reason,
                tablet_id: r.tablet_id,
                blocked_generation: None,
            }),
            Self::CollectGarbage(r) => Response::CollectGarbage(CollectGarbageResult {
                status,
                reason,
                tablet_id: r.cmd.tablet_id,
                record_generation: r.cmd.record_generation,
                per_generation_counter: r.cmd.per_generation_counter,
                channel: r.cmd.channel,
            }),
            Self::GetBarrier(_) => Response::GetBarrier(GetBarrierResult {
                status,
                reason,
                barriers: Vec::new(),
            }),
            Self::Compact(_) => Response::Compact(CompactResult { status, reason }),
            Self::Status(_) => Response::Status(StatusResult {
                status,
                reason,
                info: None,
            }),
            Self::DbStat(r) => Response::DbStat(DbStatResult {
                status,
                reason,
                db: r.db,
                records: 0,
            }),
            Self::PatchStart(r) => Response::Patch(PatchResult {
                status,
                reason,
                original_id: r.original_id,
            }),
            Self::PatchDiff(r) => Response::Patch(PatchResult {
                status,
                reason,
                original_id: r.original_id,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Replies
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct PutResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub id: LogoBlobId,
    pub oos: OutOfSpaceFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MultiPutItemStatus {
    pub id: LogoBlobId,
    pub status: ReplyStatus,
}

#[derive(Clone, Debug)]
pub struct MultiPutResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub items: Vec<MultiPutItemStatus>,
}

/// Result of one multi-put item, delivered to the batch collector
#[derive(Clone, Debug)]
pub struct MultiPutItemResult {
    pub id: LogoBlobId,
    pub idx: usize,
    pub status: ReplyStatus,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub id: LogoBlobId,
    pub status: ReplyStatus,
    pub data: Option<Bytes>,
    pub placement: Option<DiskPart>,
}

impl QueryResult {
    #[must_use]
    pub const fn status_only(id: LogoBlobId, status: ReplyStatus) -> Self {
        Self {
            id,
            status,
            data: None,
            placement: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GetResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub results: Vec<QueryResult>,
    pub blocked_generation: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct BlockResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub tablet_id: u64,
    pub actual_generation: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct GetBlockResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub tablet_id: u64,
    pub blocked_generation: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct CollectGarbageResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub tablet_id: u64,
    pub record_generation: u32,
    pub per_generation_counter: u32,
    pub channel: u8,
}

#[derive(Clone, Debug)]
pub struct GetBarrierResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub barriers: Vec<(BarrierKey, Barrier)>,
}

#[derive(Clone, Debug)]
pub struct CompactResult {
    pub status: ReplyStatus,
    pub reason: String,
}

/// Point-in-time description of a storage unit
#[derive(Clone, Debug)]
pub struct StatusInfo {
    pub vdisk_id: VDiskId,
    pub state: &'static str,
    pub readiness: VDiskStatus,
    pub repl_done: bool,
    pub has_unreadable: bool,
    pub confirmed_lsn: Lsn,
    pub db_birth_lsn: Option<Lsn>,
    pub incarnation: Uuid,
    pub emergency_queue_len: usize,
    pub active_actors: usize,
    pub stat: DbStat,
}

#[derive(Clone, Debug)]
pub struct StatusResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub info: Option<StatusInfo>,
}

#[derive(Clone, Debug)]
pub struct DbStatResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub db: HullDbType,
    pub records: u64,
}

#[derive(Clone, Debug)]
pub struct PatchResult {
    pub status: ReplyStatus,
    pub reason: String,
    pub original_id: LogoBlobId,
}

/// Reply to an internal write-class message
#[derive(Clone, Debug)]
pub struct InternalResult {
    pub kind: MessageKind,
    pub status: ReplyStatus,
    pub reason: String,
}

#[derive(Clone, Debug)]
pub enum Response {
    Put(PutResult),
    MultiPut(MultiPutResult),
    MultiPutItem(MultiPutItemResult),
    Get(GetResult),
    Block(BlockResult),
    GetBlock(GetBlockResult),
    CollectGarbage(CollectGarbageResult),
    GetBarrier(GetBarrierResult),
    Compact(CompactResult),
    Status(StatusResult),
    DbStat(DbStatResult),
    Patch(PatchResult),
    Internal(InternalResult),
}

impl Response {
    #[must_use]
    pub const fn status(&self) -> ReplyStatus {
        match self {
            Self::Put(r) => r.status,
            Self::MultiPut(r) => r.status,
            Self::MultiPutItem(r) => r.status,
            Self::Get(r) => r.status,
            Self::Block(r) => r.status,
            Self::GetBlock(r) => r.status,
            Self::CollectGarbage(r) => r.status,
            Self::GetBarrier(r) => r.status,
            Self::Compact(r) => r.status,
            Self::Status(r) => r.status,
            Self::DbStat(r) => r.status,
            Self::Patch(r) => r.status,
            Self::Internal(r) => r.status,
        }
    }

    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Put(r) => &r.reason,
            Self::MultiPut(r) => &r.reason,
            Self::MultiPutItem(r) => &r.reason,
            Self::Get(r) => &r.reason,
            Self::Block(r) => &r.reason,
            Self::GetBlock(r) => &r.reason,
            Self::CollectGarbage(r) => &r.reason,
            Self::GetBarrier(r) => &r.reason,
            Self::Compact(r) => &r.reason,
            Self::Status(r) => &r.reason,
            Self::DbStat(r) => &r.reason,
            Self::Patch(r) => &r.reason,
            Self::Internal(r) => &r.reason,
        }
    }

    #[must_use]
    pub fn internal(kind: MessageKind, status: ReplyStatus, reason: impl Into<String>) -> Self {
        Self::Internal(InternalResult {
            kind,
            status,
            reason: reason.into(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal write-class messages
// ---------------------------------------------------------------------------

/// Records pulled from a peer by the synchronizer
#[derive(Clone, Debug)]
pub struct LocalSyncData {
    pub source: VDiskId,
    pub data: SyncData,
}

/// Repair write issued by the anubis/osiris worker
#[derive(Clone, Copy, Debug)]
pub struct AnubisOsirisPut {
    pub vdisk_id: VDiskId,
    pub id: LogoBlobId,
}

#[derive(Clone, Debug)]
pub struct DetectedPhantomBlob {
    pub ids: Vec<LogoBlobId>,
}

/// Handoff deletion of a blob part that now lives on its primary
#[derive(Clone, Copy, Debug)]
pub struct DelLogoBlobDataSyncLog {
    pub id: LogoBlobId,
    pub orig_vdisk: VDiskId,
}

#[derive(Clone, Debug)]
pub struct RecoveredHugeBlob {
    pub id: LogoBlobId,
    pub data: Bytes,
}

/// Which reply a huge blob write finishes with
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HugeReplyKind {
    Put,
    MultiPutItem { idx: usize },
    Recovered,
}

#[derive(Clone, Debug)]
pub struct HugeReply {
    pub to: ReplyTo,
    pub kind: HugeReplyKind,
}

impl HugeReply {
    #[must_use]
    pub fn response(&self, id: LogoBlobId, status: ReplyStatus, reason: impl Into<String>, oos: OutOfSpaceFlags) -> Response {
        let reason = reason.into();
        match self.kind {
            HugeReplyKind::Put => Response::Put(PutResult {
                status,
                reason,
                id,
                oos,
            }),
            HugeReplyKind::MultiPutItem { idx } => Response::MultiPutItem(MultiPutItemResult {
                id,
                idx,
                status,
                reason,
            }),
            HugeReplyKind::Recovered => Response::internal(MessageKind::RecoveredHugeBlob, status, reason),
        }
    }
}

/// Placement reported by the large-object keeper (or synthesized for an
/// empty payload)
#[derive(Clone, Debug)]
pub struct HullLogHugeBlob {
    pub write_id: u64,
    pub id: LogoBlobId,
    pub placement: DiskPart,
    pub ignore_block: bool,
    pub reply: HugeReply,
}

#[derive(Clone, Copy, Debug)]
pub struct LoggedEntry {
    pub handle: VaultHandle,
    pub seg: LsnSeg,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogStatus {
    Ok,
    Error(String),
}

/// Durability confirmation for a batch of log entries, in write order
#[derive(Clone, Debug)]
pub struct LogResult {
    pub status: LogStatus,
    pub entries: Vec<LoggedEntry>,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Outcome of replaying the local recovery log
pub struct LocalRecoveryDone {
    pub ok: bool,
    pub reason: String,
    /// Rebuilt index; `None` on failure
    pub index: Option<Box<dyn IndexStore>>,
    /// Highest sequence number found in the recovery log
    pub recovered_lsn: Lsn,
    pub space: OutOfSpaceState,
}

impl fmt::Debug for LocalRecoveryDone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRecoveryDone")
            .field("ok", &self.ok)
            .field("reason", &self.reason)
            .field("recovered_lsn", &self.recovered_lsn)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SyncGuidRecoveryDone {
    pub ok: bool,
    pub db_birth_lsn: Lsn,
}

/// Log-space reclamation notice: entries up to `free_up_to_lsn` may be cut
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CutLog {
    pub free_up_to_lsn: Lsn,
}

#[derive(Clone, Debug)]
pub struct GenerationChange {
    pub group: Arc<GroupInfo>,
    pub vdisk_id: VDiskId,
}

/// Every message kind the skeleton mailbox carries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Put,
    MultiPut,
    Get,
    Block,
    GetBlock,
    CollectGarbage,
    GetBarrier,
    Compact,
    Status,
    DbStat,
    PatchStart,
    PatchDiff,
    LocalSyncData,
    AnubisOsirisPut,
    DetectedPhantomBlob,
    DelLogoBlobDataSyncLog,
    RecoveredHugeBlob,
    HullLogHugeBlob,
    LogResult,
    ConfigureSchedulerResult,
    CompactVDisk,
    HullCompactResult,
    CompactionFinished,
    KickEmergencyQueue,
    WakeupEmergencyQueue,
    TakeSnapshot,
    LocalRecoveryDone,
    SyncGuidRecoveryDone,
    CutLog,
    GenerationChange,
    CommenceRepl,
    ReplDone,
    ScrubStatus,
    PatchDying,
    ActorDied,
    Poison,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The skeleton mailbox
#[derive(Debug)]
pub enum SkeletonMsg {
    Client { request: ClientRequest, reply: ReplyTo },
    LocalSyncData(LocalSyncData, ReplyTo),
    AnubisOsirisPut(AnubisOsirisPut, ReplyTo),
    DetectedPhantomBlob(DetectedPhantomBlob, ReplyTo),
    DelLogoBlobDataSyncLog(DelLogoBlobDataSyncLog, ReplyTo),
    RecoveredHugeBlob(RecoveredHugeBlob, ReplyTo),
    HullLogHugeBlob(HullLogHugeBlob),
    LogResult(LogResult),
    ConfigureSchedulerResult { ok: bool, reason: String },
    CompactVDisk { mask: HullDbMask, reply: ReplyTo },
    HullCompactResult { db: HullDbType, request_id: u64 },
    CompactionFinished,
    KickEmergencyQueue,
    WakeupEmergencyQueue,
    TakeSnapshot(oneshot::Sender<Arc<dyn IndexSnapshot>>),
    LocalRecoveryDone(LocalRecoveryDone),
    SyncGuidRecoveryDone(SyncGuidRecoveryDone),
    CutLog(CutLog),
    GenerationChange(GenerationChange),
    CommenceRepl,
    ReplDone,
    ScrubStatus { has_unreadable: bool },
    PatchDying(LogoBlobId),
    ActorDied(u64),
    Poison,
}

impl SkeletonMsg {
    /// Wrap a client request
    #[must_use]
    pub const fn client(request: ClientRequest, reply: ReplyTo) -> Self {
        Self::Client { request, reply }
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Client { request, .. } => request.kind(),
            Self::LocalSyncData(..) => MessageKind::LocalSyncData,
            Self::AnubisOsirisPut(..) => MessageKind::AnubisOsirisPut,
            Self::DetectedPhantomBlob(..) => MessageKind::DetectedPhantomBlob,
            Self::DelLogoBlobDataSyncLog(..) => MessageKind::DelLogoBlobDataSyncLog,
            Self::RecoveredHugeBlob(..) => MessageKind::RecoveredHugeBlob,
            Self::HullLogHugeBlob(_) => MessageKind::HullLogHugeBlob,
            Self::LogResult(_) => MessageKind::LogResult,
            Self::ConfigureSchedulerResult { .. } => MessageKind::ConfigureSchedulerResult,
            Self::CompactVDisk { .. } => MessageKind::CompactVDisk,
            Self::HullCompactResult { .. } => MessageKind::HullCompactResult,
            Self::CompactionFinished => MessageKind::CompactionFinished,
            Self::KickEmergencyQueue => MessageKind::KickEmergencyQueue,
            Self::WakeupEmergencyQueue => MessageKind::WakeupEmergencyQueue,
            Self::TakeSnapshot(_) => MessageKind::TakeSnapshot,
            Self::LocalRecoveryDone(_) => MessageKind::LocalRecoveryDone,
            Self::SyncGuidRecoveryDone(_) => MessageKind::SyncGuidRecoveryDone,
            Self::CutLog(_) => MessageKind::CutLog,
            Self::GenerationChange(_) => MessageKind::GenerationChange,
            Self::CommenceRepl => MessageKind::CommenceRepl,
            Self::ReplDone => MessageKind::ReplDone,
            Self::ScrubStatus { .. } => MessageKind::ScrubStatus,
            Self::PatchDying(_) => MessageKind::PatchDying,
            Self::ActorDied(_) => MessageKind::ActorDied,
            Self::Poison => MessageKind::Poison,
        }
    }

    /// Terminate a message that will not be processed, replying `status` to
    /// its requester if it has one. Returns whether a reply was sent.
    pub fn reject(self, status: ReplyStatus, reason: &str) -> bool {
        let kind = self.kind();
        let reply = match self {
            Self::Client { request, reply } => {
                reply.send(request.error_response(status, reason));
                return true;
            }
            Self::LocalSyncData(_, reply)
            | Self::AnubisOsirisPut(_, reply)
            | Self::DetectedPhantomBlob(_, reply)
            | Self::DelLogoBlobDataSyncLog(_, reply)
            | Self::RecoveredHugeBlob(_, reply)
            | Self::CompactVDisk { reply, .. } => reply,
            Self::HullLogHugeBlob(msg) => {
                msg.reply.to.send(msg.reply.response(msg.id, status, reason, OutOfSpaceFlags::NONE));
                return true;
            }
            _ => return false,
        };
        reply.send(Response::internal(kind, status, reason));
        true
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// One record submitted to the log writer
#[derive(Clone, Debug)]
pub struct LogEntry {
    pub handle: VaultHandle,
    pub seg: LsnSeg,
    pub confirm_sync_log: bool,
    pub update: IndexUpdate,
}

#[derive(Debug)]
pub enum LogWriterMsg {
    /// Append entries in order and answer with one `LogResult`
    Log(Vec<LogEntry>),
    ConfigureScheduler(SchedulerWeights),
    Poison,
}

#[derive(Clone, Debug)]
pub struct HugeWrite {
    pub id: LogoBlobId,
    pub data: Bytes,
    pub ignore_block: bool,
    pub reply: HugeReply,
}

#[derive(Debug)]
pub enum HugeKeeperMsg {
    Write(HugeWrite),
    /// Outcome of logging a huge blob; `slot_is_used == false` frees the slot
    Logged {
        write_id: u64,
        placement: DiskPart,
        lsn: Lsn,
        slot_is_used: bool,
    },
    CutLog(CutLog),
    Poison,
}

/// Messages for long-lived subsystems (sync log, syncer, repl, scrub, ...)
#[derive(Clone, Debug)]
pub enum PeerMsg {
    GenerationChange(GenerationChange),
    CutLog(CutLog),
    CommenceRepl,
    Poison,
}

/// Reports to the node that hosts the skeleton
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeMsg {
    Status { vdisk_id: VDiskId, status: VDiskStatus },
    DropDonor { vdisk_id: VDiskId },
    DatabaseError { vdisk_id: VDiskId, reason: String },
    ScrubStatus { vdisk_id: VDiskId, has_unreadable: bool },
}

#[derive(Debug)]
pub enum PatchMsg {
    Diff(PatchDiff, ReplyTo),
    Poison,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_request() -> PutRequest {
        PutRequest {
            vdisk_id: VDiskId::new(1, 1, 0, 0, 0),
            id: LogoBlobId::new(7, 1, 1, 0, 4, 0).with_part(1),
            data: Bytes::from_static(b"abcd"),
            ignore_block: false,
        }
    }

    #[test]
    fn test_error_response_per_kind() {
        let request = ClientRequest::Put(put_request());
        let response = request.error_response(ReplyStatus::Race, "group generation mismatch");
        assert_eq!(response.status(), ReplyStatus::Race);
        assert_eq!(response.reason(), "group generation mismatch");
        assert!(matches!(response, Response::Put(ref r) if r.id == put_request().id));

        let multi = ClientRequest::MultiPut(MultiPutRequest {
            vdisk_id: VDiskId::default(),
            items: vec![
                MultiPutItem {
                    id: LogoBlobId::new(1, 1, 1, 0, 1, 0),
                    data: Bytes::new(),
                },
                MultiPutItem {
                    id: LogoBlobId::new(1, 1, 2, 0, 1, 0),
                    data: Bytes::new(),
                },
            ],
            ignore_block: false,
        });
        let Response::MultiPut(result) = multi.error_response(ReplyStatus::NotReady, "") else {
            panic!("unexpected response kind");
        };
        assert_eq!(result.items.len(), 2);
        assert!(result.items.iter().all(|i| i.status == ReplyStatus::NotReady));
    }

    #[tokio::test]
    async fn test_reject_replies_to_requester() {
        let (addr, mut rx) = Addr::<Reply>::channel();
        let msg = SkeletonMsg::client(ClientRequest::Put(put_request()), ReplyTo::new(addr.clone(), 42));
        assert_eq!(msg.kind(), MessageKind::Put);
        assert!(msg.reject(ReplyStatus::NotReady, "recovering"));
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.cookie, 42);
        assert_eq!(reply.response.status(), ReplyStatus::NotReady);

        let msg = SkeletonMsg::DetectedPhantomBlob(DetectedPhantomBlob { ids: vec![] }, ReplyTo::new(addr, 7));
        assert!(msg.reject(ReplyStatus::NotReady, "recovering"));
        let reply = rx.recv().await.unwrap();
        assert!(matches!(
            reply.response,
            Response::Internal(InternalResult {
                kind: MessageKind::DetectedPhantomBlob,
                ..
            })
        ));

        assert!(!SkeletonMsg::CompactionFinished.reject(ReplyStatus::NotReady, ""));
    }

    #[test]
    fn test_addr_closed() {
        let (addr, rx) = Addr::<PeerMsg>::channel();
        assert!(!addr.is_closed());
        assert!(addr.same_mailbox(&addr.clone()));
        drop(rx);
        assert!(addr.is_closed());
        assert!(!addr.send(PeerMsg::Poison));
    }
}
