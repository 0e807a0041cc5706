//! The skeleton actor
//!
//! One skeleton owns one storage unit. It processes its mailbox one message
//! at a time and never waits: every step that needs durability or another
//! subsystem sends a message and returns, and the outcome comes back through
//! the mailbox as a new message.
//!
//! # States
//!
//! - **LocalRecovery**: waiting for the recovery log replay; no client traffic
//! - **SyncGuidRecovery**: collaborators running, peers being consulted;
//!   deletion bookkeeping, compaction and status only
//! - **Normal**: full protocol surface
//! - **DatabaseError**: terminal; client requests are rejected
//!
//! Handlers live in submodules: `write` (write path and admission),
//! `read` (read path, compaction and patch control) and `lifecycle`
//! (state transitions, status and shutdown).

mod lifecycle;
mod read;
mod write;


use crate::active_actors::ActiveActors;
use crate::compaction::VDiskCompactionState;
use crate::index::IndexStore;
use crate::launcher::{LaunchCtx, Subsystem, SubsystemLauncher};
use crate::lsn::LsnManager;
use crate::messages::{
    Addr, ClientRequest, CutLog, HugeKeeperMsg, LogWriterMsg, MessageKind, NodeMsg, PatchMsg, PeerMsg, ReplyTo,
    SkeletonMsg,
};
use crate::oos::{OutOfSpaceLogic, OutOfSpaceState, WriteClass};
use crate::overload::OverloadHandler;
use crate::vault::LoggedRecsVault;
use derive_more::Display;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;
use vdisk_common::{Error, GroupInfo, LogoBlobId, Lsn, ReplyStatus, Result, VDiskConfig, VDiskId, VDiskStatus};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum SkeletonState {
    LocalRecovery,
    SyncGuidRecovery,
    Normal,
    DatabaseError,
}

impl SkeletonState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalRecovery => "LocalRecovery",
            Self::SyncGuidRecovery => "SyncGuidRecovery",
            Self::Normal => "Normal",
            Self::DatabaseError => "DatabaseError",
        }
    }
}

/// Whether `state` handles messages of `kind`
#[must_use]
pub const fn accepts(state: SkeletonState, kind: MessageKind) -> bool {
    use MessageKind as K;

    // Accepted in every state
    if matches!(
        kind,
        K::Status
            | K::GenerationChange
            | K::CutLog
            | K::ActorDied
            | K::KickEmergencyQueue
            | K::WakeupEmergencyQueue
            | K::PatchDying
            | K::Poison
    ) {
        return true;
    }

    match state {
        SkeletonState::LocalRecovery => matches!(kind, K::LocalRecoveryDone),
        SkeletonState::SyncGuidRecovery => matches!(
            kind,
            K::SyncGuidRecoveryDone
                | K::LogResult
                | K::ConfigureSchedulerResult
                | K::DetectedPhantomBlob
                | K::DelLogoBlobDataSyncLog
                | K::Compact
                | K::CompactVDisk
                | K::HullCompactResult
                | K::CompactionFinished
                | K::TakeSnapshot
                | K::DbStat
                | K::CommenceRepl
                | K::ScrubStatus
        ),
        SkeletonState::Normal => !matches!(kind, K::LocalRecoveryDone | K::SyncGuidRecoveryDone),
        SkeletonState::DatabaseError => matches!(
            kind,
            K::LogResult | K::ConfigureSchedulerResult | K::HullCompactResult | K::CompactionFinished | K::ReplDone
        ),
    }
}

/// Everything that exists only once local recovery has succeeded
pub(crate) struct Db {
    pub(crate) lsn: LsnManager,
    pub(crate) index: Box<dyn IndexStore>,
    pub(crate) log_writer: Addr<LogWriterMsg>,
    pub(crate) huge_keeper: Addr<HugeKeeperMsg>,
    pub(crate) peers: Vec<(Subsystem, Addr<PeerMsg>)>,
    pub(crate) compaction: VDiskCompactionState,
    pub(crate) oos: OutOfSpaceLogic,
    pub(crate) overload: OverloadHandler,
}

impl Db {
    fn peer(&self, kind: Subsystem) -> Option<&Addr<PeerMsg>> {
        self.peers.iter().find(|(k, _)| *k == kind).map(|(_, addr)| addr)
    }

    /// Start every compaction request whose wait lsn is now durable
    fn start_ready_compactions(&mut self) {
        let confirmed = self.lsn.confirmed_lsn();
        for (request_id, mask) in self.compaction.ready(confirmed) {
            for db in mask.iter() {
                debug!(request_id, %db, confirmed, "starting compaction");
                self.index.compact(db, request_id);
            }
        }
    }
}

pub struct Skeleton {
    state: SkeletonState,
    self_id: VDiskId,
    group: Arc<GroupInfo>,
    config: Arc<VDiskConfig>,
    self_addr: Addr<SkeletonMsg>,
    node: Addr<NodeMsg>,
    launcher: Box<dyn SubsystemLauncher>,
    db: Option<Db>,
    vault: LoggedRecsVault,
    active: ActiveActors,
    space: OutOfSpaceState,
    /// Latest cut received before local recovery finished
    delayed_cut_log: Option<CutLog>,
    patch_sessions: HashMap<LogoBlobId, Addr<PatchMsg>>,
    repl_done: bool,
    has_unreadable: bool,
    commence_repl_pending: bool,
    last_status: Option<VDiskStatus>,
    /// Highest lsn found by local recovery
    recovered_lsn: Lsn,
    db_birth_lsn: Option<Lsn>,
    incarnation: Uuid,
    stopped: bool,
}

impl Skeleton {
    /// A skeleton in LocalRecovery whose mailbox is `self_addr`
    #[must_use]
    pub fn new(
        self_id: VDiskId,
        group: Arc<GroupInfo>,
        config: Arc<VDiskConfig>,
        self_addr: Addr<SkeletonMsg>,
        node: Addr<NodeMsg>,
        launcher: Box<dyn SubsystemLauncher>,
    ) -> Self {
        Self {
            state: SkeletonState::LocalRecovery,
            self_id,
            group,
            config,
            self_addr,
            node,
            launcher,
            db: None,
            vault: LoggedRecsVault::new(),
            active: ActiveActors::new(),
            space: OutOfSpaceState::new(),
            delayed_cut_log: None,
            patch_sessions: HashMap::new(),
            repl_done: false,
            has_unreadable: false,
            commence_repl_pending: false,
            last_status: None,
            recovered_lsn: 0,
            db_birth_lsn: None,
            incarnation: Uuid::new_v4(),
            stopped: false,
        }
    }

    /// Create the mailbox, build the skeleton and run it on the current
    /// runtime
    pub fn spawn(
        self_id: VDiskId,
        group: Arc<GroupInfo>,
        config: Arc<VDiskConfig>,
        node: Addr<NodeMsg>,
        launcher: Box<dyn SubsystemLauncher>,
    ) -> (Addr<SkeletonMsg>, JoinHandle<()>) {
        let (addr, rx) = Addr::channel();
        let skeleton = Self::new(self_id, group, config, addr.clone(), node, launcher);
        let handle = tokio::spawn(skeleton.run(rx));
        (addr, handle)
    }

    #[must_use]
    pub const fn state(&self) -> SkeletonState {
        self.state
    }

    #[must_use]
    pub const fn self_id(&self) -> VDiskId {
        self.self_id
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Shared space flags, published by the space tracker
    #[must_use]
    pub const fn space(&self) -> &OutOfSpaceState {
        &self.space
    }

    /// Call the launcher with a context describing this unit
    fn with_launcher<R>(&mut self, f: impl FnOnce(&mut dyn SubsystemLauncher, &LaunchCtx<'_>) -> R) -> R {
        let ctx = LaunchCtx {
            skeleton: &self.self_addr,
            vdisk_id: self.self_id,
            group: &self.group,
            config: &self.config,
            recovered_lsn: self.recovered_lsn,
            space: &self.space,
        };
        f(self.launcher.as_mut(), &ctx)
    }

    /// Process one message
    ///
    /// A message the current state does not handle is answered with an
    /// error reply (when it has a requester) and reported as
    /// [`Error::UnexpectedMessage`].
    pub fn handle(&mut self, msg: SkeletonMsg) -> Result<()> {
        let kind = msg.kind();
        if !accepts(self.state, kind) {
            let status = if self.state == SkeletonState::DatabaseError {
                ReplyStatus::Error
            } else {
                ReplyStatus::NotReady
            };
            let reason = format!("VDisk {} is in state {}", self.self_id, self.state);
            if let SkeletonMsg::HullLogHugeBlob(huge) = &msg
                && let Some(db) = &self.db
            {
                write::release_huge_slot(db, huge);
            }
            msg.reject(status, &reason);
            return Err(Error::UnexpectedMessage {
                kind: kind.to_string(),
                state: self.state.to_string(),
            });
        }
        trace!(vdisk = %self.self_id, %kind, state = %self.state, "handle");

        match msg {
            SkeletonMsg::Client { request, reply } => self.handle_client(request, reply),
            SkeletonMsg::LocalSyncData(data, reply) => self.handle_local_sync_data(data, reply),
            SkeletonMsg::AnubisOsirisPut(put, reply) => self.handle_anubis_osiris_put(put, reply),
            SkeletonMsg::DetectedPhantomBlob(msg, reply) => self.handle_phantoms(msg, reply),
            SkeletonMsg::DelLogoBlobDataSyncLog(msg, reply) => self.handle_handoff_del(msg, reply),
            SkeletonMsg::RecoveredHugeBlob(msg, reply) => self.handle_recovered_huge_blob(msg, reply),
            SkeletonMsg::HullLogHugeBlob(msg) => self.handle_hull_log_huge_blob(msg),
            SkeletonMsg::LogResult(result) => self.handle_log_result(result),
            SkeletonMsg::ConfigureSchedulerResult { ok, reason } => self.handle_configure_scheduler_result(ok, &reason),
            SkeletonMsg::CompactVDisk { mask, reply } => self.handle_compact_vdisk(mask, reply),
            SkeletonMsg::HullCompactResult { db, request_id } => self.handle_hull_compact_result(db, request_id),
            SkeletonMsg::CompactionFinished => self.process_postponed(true),
            SkeletonMsg::KickEmergencyQueue | SkeletonMsg::WakeupEmergencyQueue => self.process_postponed(false),
            SkeletonMsg::TakeSnapshot(tx) => {
                if let Some(db) = &self.db {
                    // the requester may have given up waiting
                    let _ = tx.send(db.index.take_snapshot());
                }
            }
            SkeletonMsg::LocalRecoveryDone(done) => self.handle_local_recovery_done(done),
            SkeletonMsg::SyncGuidRecoveryDone(done) => self.handle_sync_guid_recovery_done(done),
            SkeletonMsg::CutLog(cut) => self.handle_cut_log(cut),
            SkeletonMsg::GenerationChange(change) => self.handle_generation_change(change),
            SkeletonMsg::CommenceRepl => self.handle_commence_repl(),
            SkeletonMsg::ReplDone => self.handle_repl_done(),
            SkeletonMsg::ScrubStatus { has_unreadable } => self.handle_scrub_status(has_unreadable),
            SkeletonMsg::PatchDying(id) => {
                self.patch_sessions.remove(&id);
            }
            SkeletonMsg::ActorDied(id) => {
                self.active.erase(id);
            }
            SkeletonMsg::Poison => self.handle_poison(),
        }
        Ok(())
    }

    /// Route a client request after the space and identity checks
    fn handle_client(&mut self, request: ClientRequest, reply: ReplyTo) {
        let class = match &request {
            ClientRequest::Put(_) | ClientRequest::MultiPut(_) => Some(WriteClass::Put),
            ClientRequest::Block(_) | ClientRequest::CollectGarbage(_) => Some(WriteClass::Maintenance),
            _ => None,
        };
        if let Some(class) = class
            && let Some(db) = &self.db
            && !db.oos.allow(class)
        {
            let flags = db.oos.flags();
            warn!(vdisk = %self.self_id, kind = %request.kind(), ?flags, "out of space");
            reply.send(request.error_response(ReplyStatus::OutOfSpace, "out of space"));
            return;
        }
        if request.vdisk_id() != self.self_id {
            warn!(
                vdisk = %self.self_id,
                kind = %request.kind(),
                target = %request.vdisk_id(),
                "group generation mismatch"
            );
            reply.send(request.error_response(ReplyStatus::Race, "group generation mismatch"));
            return;
        }
        if self.db.is_none() && !matches!(request, ClientRequest::Status(_)) {
            reply.send(request.error_response(ReplyStatus::NotReady, "vdisk is not initialized"));
            return;
        }

        match request {
            ClientRequest::Put(req) => self.handle_put(req, reply),
            ClientRequest::MultiPut(req) => self.handle_multi_put(req, reply),
            ClientRequest::Block(req) => self.handle_block(req, reply),
            ClientRequest::CollectGarbage(req) => self.handle_collect_garbage(req, reply),
            ClientRequest::GetBlock(req) => self.handle_get_block(req, reply),
            ClientRequest::Get(req) => self.handle_get(req, reply),
            ClientRequest::GetBarrier(req) => self.handle_get_barrier(req, reply),
            ClientRequest::DbStat(req) => self.handle_db_stat(req, reply),
            ClientRequest::Status(_) => self.handle_status(reply),
            ClientRequest::Compact(req) => self.handle_compact(req, reply),
            ClientRequest::PatchStart(req) => self.handle_patch_start(req, reply),
            ClientRequest::PatchDiff(req) => self.handle_patch_diff(req, reply),
        }
    }

    /// Run the mailbox loop until poisoned or every sender is gone
    pub async fn run(mut self, mut rx: UnboundedReceiver<SkeletonMsg>) {
        let mut wakeup = interval(self.config.emergency_wakeup_interval());
        wakeup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut status_push = interval(self.config.status_push_interval());
        status_push.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(vdisk = %self.self_id, incarnation = %self.incarnation, "skeleton started");
        while !self.stopped {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        debug!(vdisk = %self.self_id, "mailbox closed");
                        self.handle_poison();
                        break;
                    };
                    match self.handle(msg) {
                        Err(e) if e.is_retryable() => debug!(vdisk = %self.self_id, error = %e, "message rejected"),
                        Err(e) => warn!(vdisk = %self.self_id, error = %e, "message failed"),
                        Ok(()) => {}
                    }
                }
                _ = wakeup.tick() => self.process_postponed(false),
                _ = status_push.tick() => self.push_status(true),
            }
        }
        info!(vdisk = %self.self_id, "skeleton stopped");
    }
}
