//! Read path, compaction control and patch sessions
//!
//! Queries never run on the skeleton itself: each takes a snapshot of the
//! index and continues as a tracked task that replies on its own.

use super::Skeleton;
use crate::compaction::CompactionProgress;
use crate::index::DbStat;
use crate::messages::{
    ClientRequest, CompactMode, CompactRequest, CompactResult, DbStatRequest, GetBarrierRequest, GetRequest,
    PatchDiff, PatchMsg, PatchResult, PatchStart, ReplyTo, Response, StatusInfo, StatusResult,
};
use crate::query;
use tracing::{debug, error, info, trace};
use vdisk_common::{HullDbMask, HullDbType, ReplyStatus};

fn compact_ok() -> Response {
    Response::Compact(CompactResult {
        status: ReplyStatus::Ok,
        reason: String::new(),
    })
}

impl Skeleton {
    pub(super) fn handle_get(&mut self, req: GetRequest, reply: ReplyTo) {
        if let Err(e) = query::validate_get(&req, &self.config) {
            error!(vdisk = %self.self_id, error = %e, "get: query is invalid");
            reply.send(ClientRequest::Get(req).error_response(e.reply_status(), "get query is invalid"));
            return;
        }
        let Some(db) = self.db.as_ref() else {
            return;
        };
        let snapshot = db.index.take_snapshot();
        let id = self.active.spawn(self.self_addr.clone(), query::run_get(snapshot, req, reply));
        trace!(vdisk = %self.self_id, actor = id, "get spawned");
    }

    pub(super) fn handle_get_barrier(&mut self, req: GetBarrierRequest, reply: ReplyTo) {
        if req.from.tablet_id > req.to.tablet_id {
            error!(vdisk = %self.self_id, from = ?req.from, to = ?req.to, "get barrier: query is invalid");
            reply.send(ClientRequest::GetBarrier(req).error_response(ReplyStatus::Error, "get barrier query invalid"));
            return;
        }
        let Some(db) = self.db.as_ref() else {
            return;
        };
        let snapshot = db.index.take_snapshot();
        self.active
            .spawn(self.self_addr.clone(), query::run_get_barrier(snapshot, req, reply));
    }

    pub(super) fn handle_db_stat(&mut self, req: DbStatRequest, reply: ReplyTo) {
        let Some(db) = self.db.as_ref() else {
            return;
        };
        let snapshot = db.index.take_snapshot();
        self.active
            .spawn(self.self_addr.clone(), query::run_db_stat(snapshot, req, reply));
    }

    /// Everything the skeleton itself knows about the unit; index counters
    /// are filled in from a snapshot
    fn status_info(&self) -> StatusInfo {
        StatusInfo {
            vdisk_id: self.self_id,
            state: self.state.as_str(),
            readiness: self.readiness(),
            repl_done: self.repl_done,
            has_unreadable: self.has_unreadable,
            confirmed_lsn: self.db.as_ref().map_or(self.recovered_lsn, |db| db.lsn.confirmed_lsn()),
            db_birth_lsn: self.db_birth_lsn,
            incarnation: self.incarnation,
            emergency_queue_len: self.db.as_ref().map_or(0, |db| db.overload.queue_len()),
            active_actors: self.active.len(),
            stat: DbStat::default(),
        }
    }

    pub(super) fn handle_status(&mut self, reply: ReplyTo) {
        let info = self.status_info();
        match self.db.as_ref() {
            Some(db) => {
                let snapshot = db.index.take_snapshot();
                self.active
                    .spawn(self.self_addr.clone(), query::run_status(snapshot, info, reply));
            }
            None => reply.send(Response::Status(StatusResult {
                status: ReplyStatus::Ok,
                reason: String::new(),
                info: Some(info),
            })),
        }
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    pub(super) fn handle_compact(&mut self, req: CompactRequest, reply: ReplyTo) {
        let Some(db) = self.db.as_mut() else {
            return;
        };
        if req.mask.is_empty() {
            reply.send(compact_ok());
            return;
        }
        let reply = match req.mode {
            CompactMode::Sync => Some(reply),
            CompactMode::Async => {
                reply.send(compact_ok());
                None
            }
        };
        let id = db.compaction.setup(req.mask, reply, None);
        info!(vdisk = %self.self_id, id, mask = ?req.mask, mode = ?req.mode, "compaction requested");
        db.start_ready_compactions();
    }

    /// Full compaction that covers every write in flight right now
    pub(super) fn handle_compact_vdisk(&mut self, mask: HullDbMask, reply: ReplyTo) {
        let Some(db) = self.db.as_mut() else {
            return;
        };
        let wait_lsn = self.vault.last_lsn_in_flight();
        let id = db.compaction.setup(mask, Some(reply), wait_lsn);
        info!(vdisk = %self.self_id, id, ?mask, ?wait_lsn, "full compaction requested");
        db.start_ready_compactions();
    }

    pub(super) fn handle_hull_compact_result(&mut self, db_type: HullDbType, request_id: u64) {
        let Some(db) = self.db.as_mut() else {
            return;
        };
        match db.compaction.compacted(request_id, db_type) {
            CompactionProgress::Pending => {
                debug!(vdisk = %self.self_id, request_id, db = %db_type, "partition compacted");
            }
            CompactionProgress::Done(reply) => {
                info!(vdisk = %self.self_id, request_id, "compaction done");
                if let Some(reply) = reply {
                    reply.send(compact_ok());
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Patch sessions
    // -----------------------------------------------------------------------

    pub(super) fn handle_patch_start(&mut self, req: PatchStart, reply: ReplyTo) {
        if self.patch_sessions.contains_key(&req.original_id) {
            error!(vdisk = %self.self_id, id = %req.original_id, "patch: session already exists");
            reply.send(ClientRequest::PatchStart(req).error_response(ReplyStatus::Error, "patch session already exists"));
            return;
        }
        let session = self.with_launcher(|launcher, ctx| launcher.patch_session(&req, ctx));
        debug!(vdisk = %self.self_id, original = %req.original_id, patched = %req.patched_id, "patch: started");
        self.patch_sessions.insert(req.original_id, session);
        reply.send(Response::Patch(PatchResult {
            status: ReplyStatus::Ok,
            reason: String::new(),
            original_id: req.original_id,
        }));
    }

    pub(super) fn handle_patch_diff(&mut self, req: PatchDiff, reply: ReplyTo) {
        let session = self
            .patch_sessions
            .get(&req.original_id)
            .filter(|session| !session.is_closed());
        let Some(session) = session else {
            error!(vdisk = %self.self_id, id = %req.original_id, "patch: no session");
            self.patch_sessions.remove(&req.original_id);
            reply.send(ClientRequest::PatchDiff(req).error_response(ReplyStatus::Error, "patch session not found"));
            return;
        };
        session.send(PatchMsg::Diff(req, reply));
    }
}
