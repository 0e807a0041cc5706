//! Write path
//!
//! Client puts and internal write-class messages pass the space check, then
//! the overload gate; whatever proceeds is validated, checked against the
//! index store, given sequence numbers and submitted to the log writer. Replies go out
//! from [`LoggedRecord::replay`] once the log writer confirms durability.

use super::{Db, Skeleton, SkeletonState};
use crate::index::{AllocOutcome, HullCheckStatus, IndexStore};
use crate::logged_rec::{LoggedRecord, LoggedRecordKind, ReplayCtx};
use crate::messages::{
    Addr, AnubisOsirisPut, BlockRequest, BlockResult, ClientRequest, CollectGarbageRequest, CollectGarbageResult,
    DelLogoBlobDataSyncLog, DetectedPhantomBlob, GetBlockRequest, GetBlockResult, HugeKeeperMsg, HugeReply,
    HugeReplyKind, HugeWrite, HullLogHugeBlob, LocalSyncData, LogEntry, LogResult, LogStatus, LogWriterMsg,
    MessageKind, MultiPutItemResult, MultiPutItemStatus, MultiPutRequest, MultiPutResult, PendingReply, PutRequest,
    PutResult, RecoveredHugeBlob, ReplyTo, Response, SkeletonMsg,
};
use crate::multi_put::MultiPutCollector;
use crate::oos::WriteClass;
use crate::overload::{Admission, PostponedEvent};
use crate::vault::LoggedRecsVault;
use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use vdisk_common::{
    DiskPart, GroupInfo, HullDbMask, LogoBlobId, LsnSeg, OutOfSpaceFlags, ReplyStatus, VDiskConfig, VDiskId,
};

/// Size and identity checks of a blob part before anything is allocated
fn validate_part(
    group: &GroupInfo,
    config: &VDiskConfig,
    id: &LogoBlobId,
    len: usize,
) -> std::result::Result<(), &'static str> {
    let Some(part_size) = group.erasure.part_size(id) else {
        return Err("part id is incorrect");
    };
    if len != part_size as usize {
        return Err("buffer size mismatch");
    }
    if len > config.max_logo_blob_data_size as usize {
        return Err("buffer is too large");
    }
    Ok(())
}

/// The db of an internal write, or `None` after replying that it cannot be
/// taken now
fn internal_db<'a>(
    db: Option<&'a mut Db>,
    vdisk: VDiskId,
    kind: MessageKind,
    reply: &ReplyTo,
) -> Option<&'a mut Db> {
    let Some(db) = db else {
        reply.send(Response::internal(kind, ReplyStatus::NotReady, "vdisk is not initialized"));
        return None;
    };
    if !db.oos.allow(WriteClass::Internal) {
        warn!(%vdisk, %kind, flags = ?db.oos.flags(), "out of space");
        reply.send(Response::internal(kind, ReplyStatus::OutOfSpace, "out of space"));
        return None;
    }
    Some(db)
}

/// Whether the part goes through the large-object keeper
fn is_huge(group: &GroupInfo, config: &VDiskConfig, id: &LogoBlobId) -> bool {
    group
        .erasure
        .part_size(id)
        .is_some_and(|size| size >= config.min_huge_blob_size)
}

/// Register `records` in the vault and hand them to the log writer as one
/// batch, then refresh the scheduler weights of the partitions they touch
fn submit(db: &mut Db, vault: &mut LoggedRecsVault, records: Vec<LoggedRecord>) {
    let mut mask = HullDbMask::EMPTY;
    let mut entries = Vec::with_capacity(records.len());
    for record in records {
        let update = record.update();
        for db_type in update.db_types() {
            mask |= db_type.mask();
        }
        let seg = record.seg;
        let confirm_sync_log = record.confirm_sync_log;
        let handle = vault.put(record);
        entries.push(LogEntry {
            handle,
            seg,
            confirm_sync_log,
            update,
        });
    }
    if entries.is_empty() {
        return;
    }
    if !db.log_writer.send(LogWriterMsg::Log(entries)) {
        warn!("log writer is gone, entries stay in the vault");
    }
    let backlog = db.index.backlog();
    db.overload.actualize_weights(&backlog, mask, false);
}

/// Finish a write the index store refused: reply now, or once the lsn the
/// refusal depends on is durable
fn finish_rejected(index: &mut dyn IndexStore, to: ReplyTo, response: Response, check: &HullCheckStatus) {
    match check.postponed_until {
        Some(lsn) => index.postpone_reply_until_committed(PendingReply { to, response }, lsn),
        None => to.send(response),
    }
}

fn put_response(id: LogoBlobId, status: ReplyStatus, reason: impl Into<String>, oos: OutOfSpaceFlags) -> Response {
    Response::Put(PutResult {
        status,
        reason: reason.into(),
        id,
        oos,
    })
}

/// Per-item outcome of multi-put admission
struct ItemPlan {
    id: LogoBlobId,
    data: Bytes,
    huge: bool,
    check: HullCheckStatus,
}

impl Skeleton {
    // -----------------------------------------------------------------------
    // Overload gate
    // -----------------------------------------------------------------------

    fn admit(&mut self, ev: PostponedEvent) {
        let Some(db) = self.db.as_mut() else {
            SkeletonMsg::from(ev).reject(ReplyStatus::NotReady, "vdisk is not initialized");
            return;
        };
        let backlog = db.index.backlog();
        match db.overload.postpone_event(ev, &backlog) {
            Admission::Proceed(ev) => self.process_event(ev),
            Admission::Postponed { kick } => {
                if kick {
                    self.self_addr.send(SkeletonMsg::KickEmergencyQueue);
                }
            }
        }
    }

    fn process_event(&mut self, ev: PostponedEvent) {
        trace!(vdisk = %self.self_id, event = ev.name(), "processing write");
        match ev {
            PostponedEvent::Put(req, reply) => self.put_private(req, reply),
            PostponedEvent::MultiPut(req, reply) => self.multi_put_private(req, reply),
            PostponedEvent::LocalSyncData(data, reply) => self.local_sync_data_private(data, reply),
            PostponedEvent::AnubisOsirisPut(put, reply) => self.anubis_osiris_put_private(put, reply),
        }
    }

    /// Drain the emergency queue while the backlog allows it
    pub(super) fn process_postponed(&mut self, actualize: bool) {
        if self.state != SkeletonState::Normal {
            return;
        }
        let Some(db) = self.db.as_mut() else {
            return;
        };
        if actualize {
            let backlog = db.index.backlog();
            db.overload.actualize_weights(&backlog, HullDbMask::ALL, true);
        }

        let batch = db.overload.batch_size();
        for _ in 0..batch {
            let Some(db) = self.db.as_mut() else {
                return;
            };
            let backlog = db.index.backlog();
            let Some(ev) = db.overload.pop_postponed(&backlog) else {
                break;
            };
            self.process_event(ev);
        }

        if let Some(db) = self.db.as_ref()
            && !db.overload.is_empty()
            && !db.overload.overloaded(&db.index.backlog())
        {
            self.self_addr.send(SkeletonMsg::KickEmergencyQueue);
        }
    }

    // -----------------------------------------------------------------------
    // Put
    // -----------------------------------------------------------------------

    pub(super) fn handle_put(&mut self, req: PutRequest, reply: ReplyTo) {
        self.admit(PostponedEvent::Put(req, reply));
    }

    fn put_private(&mut self, req: PutRequest, reply: ReplyTo) {
        let Some(db) = self.db.as_mut() else {
            return;
        };
        let oos = db.oos.flags();
        let huge = is_huge(&self.group, &self.config, &req.id);

        if !db.oos.allow(WriteClass::Put) {
            warn!(vdisk = %self.self_id, id = %req.id, ?oos, "put: out of space");
            reply.send(put_response(req.id, ReplyStatus::OutOfSpace, "out of space", oos));
            return;
        }
        if req.vdisk_id != self.self_id {
            error!(vdisk = %self.self_id, id = %req.id, target = %req.vdisk_id, "put: race");
            reply.send(put_response(req.id, ReplyStatus::Race, "group generation mismatch", oos));
            return;
        }
        if let Err(reason) = validate_part(&self.group, &self.config, &req.id, req.data.len()) {
            error!(vdisk = %self.self_id, id = %req.id, size = req.data.len(), reason, "put: invalid");
            reply.send(put_response(req.id, ReplyStatus::Error, reason, oos));
            return;
        }

        let check = db.index.check_logo_blob(&req.id, req.ignore_block);
        if !check.proceeds() {
            debug!(vdisk = %self.self_id, id = %req.id, status = %check.status, "put: not admitted");
            let response = put_response(req.id, check.status, check.reason.clone(), oos);
            finish_rejected(db.index.as_mut(), reply, response, &check);
            return;
        }

        if huge {
            let reply = HugeReply {
                to: reply,
                kind: HugeReplyKind::Put,
            };
            write_huge(&self.self_addr, db, req.id, req.data, req.ignore_block, reply);
            return;
        }

        let seg = db.lsn.alloc_for_hull_and_sync_log(1);
        trace!(vdisk = %self.self_id, id = %req.id, %seg, "put: logging");
        let record = LoggedRecord::new(
            seg,
            true,
            LoggedRecordKind::Put {
                id: req.id,
                data: req.data,
                reply,
            },
        );
        submit(db, &mut self.vault, vec![record]);
    }

    // -----------------------------------------------------------------------
    // Multi-put
    // -----------------------------------------------------------------------

    pub(super) fn handle_multi_put(&mut self, req: MultiPutRequest, reply: ReplyTo) {
        self.admit(PostponedEvent::MultiPut(req, reply));
    }

    fn multi_put_private(&mut self, req: MultiPutRequest, reply: ReplyTo) {
        if req.items.is_empty() {
            error!(vdisk = %self.self_id, "multi-put: empty");
            reply.send(ClientRequest::MultiPut(req).error_response(ReplyStatus::Error, "empty multiput"));
            return;
        }
        let Some(db) = self.db.as_mut() else {
            return;
        };
        if !db.oos.allow(WriteClass::Put) {
            warn!(vdisk = %self.self_id, flags = ?db.oos.flags(), "multi-put: out of space");
            reply.send(ClientRequest::MultiPut(req).error_response(ReplyStatus::OutOfSpace, "out of space"));
            return;
        }
        if req.vdisk_id != self.self_id {
            error!(vdisk = %self.self_id, target = %req.vdisk_id, "multi-put: race");
            reply.send(ClientRequest::MultiPut(req).error_response(ReplyStatus::Race, "group generation mismatch"));
            return;
        }

        let ignore_block = req.ignore_block;
        let plans: Vec<ItemPlan> = req
            .items
            .iter()
            .map(|item| {
                let check = match validate_part(&self.group, &self.config, &item.id, item.data.len()) {
                    Ok(()) => db.index.check_logo_blob(&item.id, ignore_block),
                    Err(reason) => {
                        error!(vdisk = %self.self_id, id = %item.id, reason, "multi-put: invalid item");
                        HullCheckStatus::error(ReplyStatus::Error, reason)
                    }
                };
                ItemPlan {
                    id: item.id,
                    data: item.data.clone(),
                    huge: is_huge(&self.group, &self.config, &item.id),
                    check,
                }
            })
            .collect();

        // Postponed items report OK until their deferred result arrives
        let statuses: Vec<MultiPutItemStatus> = plans
            .iter()
            .map(|plan| MultiPutItemStatus {
                id: plan.id,
                status: if plan.check.is_postponed() {
                    ReplyStatus::Ok
                } else {
                    plan.check.status
                },
            })
            .collect();
        let pending = plans
            .iter()
            .filter(|plan| plan.check.is_postponed() || plan.check.proceeds())
            .count();
        if pending == 0 {
            info!(vdisk = %self.self_id, items = plans.len(), "multi-put: all items have errors");
            reply.send(Response::MultiPut(MultiPutResult {
                status: ReplyStatus::Ok,
                reason: String::new(),
                items: statuses,
            }));
            return;
        }

        let (collector, rx) = Addr::channel();
        self.active.spawn(
            self.self_addr.clone(),
            MultiPutCollector::new(statuses, pending, reply).run(rx),
        );

        let inline = plans.iter().filter(|plan| !plan.huge && plan.check.proceeds()).count() as u64;
        let mut next_lsn = if inline > 0 {
            db.lsn.alloc_for_hull_and_sync_log(inline).first
        } else {
            0
        };
        let mut records = Vec::new();

        for (idx, plan) in plans.into_iter().enumerate() {
            let to = ReplyTo::new(collector.clone(), idx as u64);
            if plan.check.is_postponed() {
                let response = Response::MultiPutItem(MultiPutItemResult {
                    id: plan.id,
                    idx,
                    status: plan.check.status,
                    reason: plan.check.reason.clone(),
                });
                finish_rejected(db.index.as_mut(), to, response, &plan.check);
                continue;
            }
            if !plan.check.proceeds() {
                continue;
            }
            if plan.huge {
                let reply = HugeReply {
                    to,
                    kind: HugeReplyKind::MultiPutItem { idx },
                };
                write_huge(&self.self_addr, db, plan.id, plan.data, ignore_block, reply);
                continue;
            }
            records.push(LoggedRecord::new(
                LsnSeg::point(next_lsn),
                true,
                LoggedRecordKind::MultiPutItem {
                    id: plan.id,
                    idx,
                    data: plan.data,
                    collector: to,
                },
            ));
            next_lsn += 1;
        }

        submit(db, &mut self.vault, records);
    }

    // -----------------------------------------------------------------------
    // Huge blobs
    // -----------------------------------------------------------------------

    /// Placement of a huge blob is known; log its descriptor
    pub(super) fn handle_hull_log_huge_blob(&mut self, msg: HullLogHugeBlob) {
        let Some(db) = self.db.as_mut() else {
            msg.reply
                .to
                .send(msg.reply.response(msg.id, ReplyStatus::NotReady, "vdisk is not initialized", OutOfSpaceFlags::NONE));
            return;
        };
        let oos = db.oos.flags();
        let check = db.index.check_logo_blob(&msg.id, msg.ignore_block);
        if !check.proceeds() {
            debug!(vdisk = %self.self_id, id = %msg.id, status = %check.status, "huge blob: not admitted");
            release_huge_slot(db, &msg);
            let response = msg.reply.response(msg.id, check.status, check.reason.clone(), oos);
            finish_rejected(db.index.as_mut(), msg.reply.to, response, &check);
            return;
        }

        let seg = db.lsn.alloc_for_hull_and_sync_log(1);
        trace!(vdisk = %self.self_id, id = %msg.id, placement = ?msg.placement, %seg, "huge blob: logging");
        let record = LoggedRecord::new(
            seg,
            true,
            LoggedRecordKind::HugeBlob {
                id: msg.id,
                placement: msg.placement,
                write_id: msg.write_id,
                reply: msg.reply,
            },
        );
        submit(db, &mut self.vault, vec![record]);
    }

    pub(super) fn handle_recovered_huge_blob(&mut self, msg: RecoveredHugeBlob, reply: ReplyTo) {
        let Some(db) = internal_db(self.db.as_mut(), self.self_id, MessageKind::RecoveredHugeBlob, &reply) else {
            return;
        };
        let reply = HugeReply {
            to: reply,
            kind: HugeReplyKind::Recovered,
        };
        write_huge(&self.self_addr, db, msg.id, msg.data, true, reply);
    }

    // -----------------------------------------------------------------------
    // Block, garbage collection
    // -----------------------------------------------------------------------

    pub(super) fn handle_block(&mut self, req: BlockRequest, reply: ReplyTo) {
        let Some(db) = self.db.as_mut() else {
            return;
        };
        let check = db
            .index
            .check_block_and_alloc_lsn(&mut db.lsn, req.tablet_id, req.generation, req.issuer_guid);
        match check.outcome {
            AllocOutcome::Allocated(seg) => {
                debug!(vdisk = %self.self_id, tablet = req.tablet_id, generation = req.generation, %seg, "block");
                let record = LoggedRecord::new(
                    seg,
                    true,
                    LoggedRecordKind::Block {
                        tablet_id: req.tablet_id,
                        generation: req.generation,
                        issuer_guid: req.issuer_guid,
                        reply,
                    },
                );
                submit(db, &mut self.vault, vec![record]);
            }
            AllocOutcome::Rejected(status) => {
                debug!(
                    vdisk = %self.self_id,
                    tablet = req.tablet_id,
                    generation = req.generation,
                    status = %status.status,
                    reason = %status.reason,
                    "block: not admitted"
                );
                let response = Response::Block(BlockResult {
                    status: status.status,
                    reason: status.reason.clone(),
                    tablet_id: req.tablet_id,
                    actual_generation: check.actual_generation,
                });
                finish_rejected(db.index.as_mut(), reply, response, &status);
            }
        }
    }

    pub(super) fn handle_get_block(&mut self, req: GetBlockRequest, reply: ReplyTo) {
        let generation = self.db.as_ref().and_then(|db| db.index.blocked_generation(req.tablet_id));
        let (status, reason) = match generation {
            Some(_) => (ReplyStatus::Ok, String::new()),
            None => (ReplyStatus::NoData, "tablet is not blocked".to_string()),
        };
        reply.send(Response::GetBlock(GetBlockResult {
            status,
            reason,
            tablet_id: req.tablet_id,
            blocked_generation: generation,
        }));
    }

    pub(super) fn handle_collect_garbage(&mut self, req: CollectGarbageRequest, reply: ReplyTo) {
        let Some(db) = self.db.as_mut() else {
            return;
        };
        let cmd = req.cmd;
        match db.index.check_gc_and_alloc_lsn(&mut db.lsn, &cmd) {
            AllocOutcome::Allocated(seg) => {
                debug!(vdisk = %self.self_id, tablet = cmd.tablet_id, channel = cmd.channel, %seg, "collect garbage");
                let record = LoggedRecord::new(seg, true, LoggedRecordKind::CollectGarbage { cmd, reply });
                submit(db, &mut self.vault, vec![record]);
            }
            AllocOutcome::Rejected(status) => {
                debug!(
                    vdisk = %self.self_id,
                    tablet = cmd.tablet_id,
                    status = %status.status,
                    reason = %status.reason,
                    "collect garbage: not admitted"
                );
                let response = Response::CollectGarbage(CollectGarbageResult {
                    status: status.status,
                    reason: status.reason.clone(),
                    tablet_id: cmd.tablet_id,
                    record_generation: cmd.record_generation,
                    per_generation_counter: cmd.per_generation_counter,
                    channel: cmd.channel,
                });
                finish_rejected(db.index.as_mut(), reply, response, &status);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Internal writes
    // -----------------------------------------------------------------------

    pub(super) fn handle_local_sync_data(&mut self, data: LocalSyncData, reply: ReplyTo) {
        if internal_db(self.db.as_mut(), self.self_id, MessageKind::LocalSyncData, &reply).is_none() {
            return;
        }
        self.admit(PostponedEvent::LocalSyncData(data, reply));
    }

    fn local_sync_data_private(&mut self, msg: LocalSyncData, reply: ReplyTo) {
        let Some(db) = internal_db(self.db.as_mut(), self.self_id, MessageKind::LocalSyncData, &reply) else {
            return;
        };
        let seg = db.index.allocate_lsn_for_sync_data(&mut db.lsn, &msg.data);
        debug!(vdisk = %self.self_id, source = %msg.source, records = msg.data.record_count(), %seg, "local sync data");
        let record = LoggedRecord::new(seg, false, LoggedRecordKind::LocalSyncData { data: msg.data, reply });
        submit(db, &mut self.vault, vec![record]);
    }

    pub(super) fn handle_anubis_osiris_put(&mut self, put: AnubisOsirisPut, reply: ReplyTo) {
        if internal_db(self.db.as_mut(), self.self_id, MessageKind::AnubisOsirisPut, &reply).is_none() {
            return;
        }
        self.admit(PostponedEvent::AnubisOsirisPut(put, reply));
    }

    fn anubis_osiris_put_private(&mut self, put: AnubisOsirisPut, reply: ReplyTo) {
        let Some(db) = internal_db(self.db.as_mut(), self.self_id, MessageKind::AnubisOsirisPut, &reply) else {
            return;
        };
        if put.vdisk_id != self.self_id {
            warn!(vdisk = %self.self_id, target = %put.vdisk_id, "anubis/osiris put: race");
            reply.send(Response::internal(
                MessageKind::AnubisOsirisPut,
                ReplyStatus::Race,
                "group generation mismatch",
            ));
            return;
        }
        let seg = db.lsn.alloc_for_hull_and_sync_log(1);
        trace!(vdisk = %self.self_id, id = %put.id, %seg, "anubis/osiris put");
        let record = LoggedRecord::new(seg, true, LoggedRecordKind::AnubisOsirisPut { id: put.id, reply });
        submit(db, &mut self.vault, vec![record]);
    }

    pub(super) fn handle_phantoms(&mut self, msg: DetectedPhantomBlob, reply: ReplyTo) {
        let Some(db) = internal_db(self.db.as_mut(), self.self_id, MessageKind::DetectedPhantomBlob, &reply) else {
            return;
        };
        let seg = db.index.allocate_lsn_for_phantoms(&mut db.lsn, &msg.ids);
        info!(vdisk = %self.self_id, count = msg.ids.len(), %seg, "deleting phantom blobs");
        let record = LoggedRecord::new(seg, true, LoggedRecordKind::Phantoms { ids: msg.ids, reply });
        submit(db, &mut self.vault, vec![record]);
    }

    pub(super) fn handle_handoff_del(&mut self, msg: DelLogoBlobDataSyncLog, reply: ReplyTo) {
        let Some(db) = internal_db(self.db.as_mut(), self.self_id, MessageKind::DelLogoBlobDataSyncLog, &reply) else {
            return;
        };
        let seg = db.lsn.alloc_for_hull_and_sync_log(1);
        trace!(vdisk = %self.self_id, id = %msg.id, orig = %msg.orig_vdisk, %seg, "handoff deletion");
        let record = LoggedRecord::new(seg, true, LoggedRecordKind::HandoffDel { id: msg.id, reply });
        submit(db, &mut self.vault, vec![record]);
    }

    // -----------------------------------------------------------------------
    // Durability
    // -----------------------------------------------------------------------

    /// The log writer confirmed (or failed) a batch of entries
    pub(super) fn handle_log_result(&mut self, result: LogResult) {
        if self.state == SkeletonState::DatabaseError {
            trace!(vdisk = %self.self_id, entries = result.entries.len(), "log result ignored");
            return;
        }
        if let LogStatus::Error(reason) = result.status {
            error!(vdisk = %self.self_id, %reason, "recovery log write failed");
            self.enter_database_error(format!("log write failed: {reason}"));
            return;
        }
        let Some(db) = self.db.as_mut() else {
            return;
        };

        let oos = db.oos.flags();
        for entry in result.entries {
            let record = self.vault.extract(entry.handle);
            if record.seg != entry.seg {
                error!(expected = %record.seg, got = %entry.seg, "log result segment mismatch");
                panic!("log result for {} carries segment {}", record.seg, entry.seg);
            }
            db.lsn.confirm_for_hull(record.seg, record.confirm_sync_log);
            record.replay(&mut ReplayCtx {
                index: db.index.as_mut(),
                huge_keeper: &db.huge_keeper,
                oos,
            });
        }

        db.index.lsn_committed(db.lsn.confirmed_lsn());
        db.start_ready_compactions();
    }

    pub(super) fn handle_configure_scheduler_result(&mut self, ok: bool, reason: &str) {
        if ok {
            trace!(vdisk = %self.self_id, "scheduler configured");
        } else {
            error!(vdisk = %self.self_id, reason, "scheduler configuration failed");
        }
    }
}

/// Hand the keeper's slot back when a placed descriptor will not be logged
pub(super) fn release_huge_slot(db: &Db, msg: &HullLogHugeBlob) {
    if msg.placement.is_empty() {
        return;
    }
    db.huge_keeper.send(HugeKeeperMsg::Logged {
        write_id: msg.write_id,
        placement: msg.placement,
        lsn: 0,
        slot_is_used: false,
    });
}

/// Send a huge payload to the keeper. An empty payload has nothing to
/// place, so its descriptor is logged right away with an empty placement.
fn write_huge(
    self_addr: &Addr<SkeletonMsg>,
    db: &Db,
    id: LogoBlobId,
    data: Bytes,
    ignore_block: bool,
    reply: HugeReply,
) {
    if data.is_empty() {
        self_addr.send(SkeletonMsg::HullLogHugeBlob(HullLogHugeBlob {
            write_id: 0,
            id,
            placement: DiskPart::default(),
            ignore_block,
            reply,
        }));
        return;
    }
    db.huge_keeper.send(HugeKeeperMsg::Write(HugeWrite {
        id,
        data,
        ignore_block,
        reply,
    }));
}
