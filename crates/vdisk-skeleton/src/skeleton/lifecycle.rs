//! State transitions, readiness reporting and shutdown

use super::{Db, Skeleton, SkeletonState};
use crate::compaction::VDiskCompactionState;
use crate::launcher::Subsystem;
use crate::lsn::LsnManager;
use crate::messages::{
    Addr, CutLog, GenerationChange, HugeKeeperMsg, LocalRecoveryDone, LogWriterMsg, NodeMsg, PatchMsg, PeerMsg,
    SkeletonMsg, SyncGuidRecoveryDone,
};
use crate::oos::OutOfSpaceLogic;
use crate::overload::OverloadHandler;
use tracing::{debug, error, info, warn};
use vdisk_common::{HullDbMask, VDiskStatus};

impl Skeleton {
    fn launch(&mut self, kind: Subsystem) -> (Subsystem, Addr<PeerMsg>) {
        debug!(vdisk = %self.self_id, subsystem = %kind, "starting subsystem");
        (kind, self.with_launcher(|launcher, ctx| launcher.subsystem(kind, ctx)))
    }

    pub(super) fn handle_local_recovery_done(&mut self, done: LocalRecoveryDone) {
        let LocalRecoveryDone {
            ok,
            reason,
            index,
            recovered_lsn,
            space,
        } = done;
        let Some(mut index) = index.filter(|_| ok) else {
            error!(vdisk = %self.self_id, %reason, "local recovery failed");
            self.enter_database_error(format!("local recovery failed: {reason}"));
            return;
        };
        self.recovered_lsn = recovered_lsn;
        self.space = space;

        let donor = self.config.donor_mode;
        if donor && recovered_lsn == 0 {
            warn!(vdisk = %self.self_id, "donor disk has been wiped out, dropping it");
            self.node.send(NodeMsg::DropDonor { vdisk_id: self.self_id });
            self.enter_database_error("donor disk has been wiped out".to_string());
            return;
        }
        info!(vdisk = %self.self_id, recovered_lsn, "local recovery succeeded");

        let log_writer = self.with_launcher(|launcher, ctx| launcher.log_writer(ctx));
        let mut peers = vec![self.launch(Subsystem::SpaceTracker)];
        if self.config.run_handoff && !donor {
            peers.push(self.launch(Subsystem::HandoffProxies));
        }
        peers.push(self.launch(Subsystem::LogCutter));
        let huge_keeper = self.with_launcher(|launcher, ctx| launcher.huge_keeper(ctx));
        peers.push(self.launch(Subsystem::SyncLog));

        index.start(self.self_addr.clone());
        let compaction = VDiskCompactionState::new();
        let oos = OutOfSpaceLogic::new(self.space.clone());
        let mut overload = OverloadHandler::new(&self.config, log_writer.clone());
        overload.actualize_weights(&index.backlog(), HullDbMask::ALL, true);
        self.self_addr.send(SkeletonMsg::WakeupEmergencyQueue);

        if self.config.run_anubis && !donor {
            peers.push(self.launch(Subsystem::Anubis));
        }
        if self.config.run_defrag {
            peers.push(self.launch(Subsystem::Defrag));
        }
        peers.push(self.launch(Subsystem::Scrub));

        self.db = Some(Db {
            lsn: LsnManager::new(recovered_lsn),
            index,
            log_writer,
            huge_keeper,
            peers,
            compaction,
            oos,
            overload,
        });

        if self.config.run_syncer && !donor {
            self.state = SkeletonState::SyncGuidRecovery;
            info!(vdisk = %self.self_id, "sync guid recovery started");
            let syncer = self.launch(Subsystem::Syncer);
            if let Some(db) = self.db.as_mut() {
                db.peers.push(syncer);
            }
            self.deliver_delayed_cut_log();
        } else {
            self.deliver_delayed_cut_log();
            self.become_normal(false);
        }
    }

    pub(super) fn handle_sync_guid_recovery_done(&mut self, done: SyncGuidRecoveryDone) {
        if !done.ok {
            error!(vdisk = %self.self_id, "sync guid recovery failed");
            self.enter_database_error("sync guid recovery failed".to_string());
            return;
        }
        info!(vdisk = %self.self_id, db_birth_lsn = done.db_birth_lsn, "sync guid recovery succeeded");
        self.db_birth_lsn = Some(done.db_birth_lsn);
        self.become_normal(self.config.run_repl && !self.config.donor_mode);
    }

    /// Enter Normal; with `run_repl` replication decides when the unit is
    /// ready, otherwise it is ready at once
    fn become_normal(&mut self, run_repl: bool) {
        self.state = SkeletonState::Normal;
        info!(vdisk = %self.self_id, "skeleton is up and running");
        if run_repl {
            let (kind, repl) = self.launch(Subsystem::Repl);
            if self.commence_repl_pending {
                repl.send(PeerMsg::CommenceRepl);
            }
            if let Some(db) = self.db.as_mut() {
                db.peers.push((kind, repl));
            }
        } else {
            self.repl_done = true;
        }
        self.push_status(false);
    }

    /// Terminal state; the node is told once
    pub(super) fn enter_database_error(&mut self, reason: String) {
        if self.state == SkeletonState::DatabaseError {
            return;
        }
        error!(vdisk = %self.self_id, state = %self.state, %reason, "entering database error state");
        self.state = SkeletonState::DatabaseError;
        self.node.send(NodeMsg::DatabaseError {
            vdisk_id: self.self_id,
            reason,
        });
        self.push_status(false);
    }

    // -----------------------------------------------------------------------
    // Log cut
    // -----------------------------------------------------------------------

    pub(super) fn handle_cut_log(&mut self, cut: CutLog) {
        if self.db.is_none() {
            if let Some(previous) = self.delayed_cut_log.replace(cut) {
                debug!(vdisk = %self.self_id, previous = previous.free_up_to_lsn, "delayed cut log replaced");
            }
            return;
        }
        self.spread_cut_log(cut);
    }

    fn deliver_delayed_cut_log(&mut self) {
        if let Some(cut) = self.delayed_cut_log.take() {
            debug!(vdisk = %self.self_id, free_up_to_lsn = cut.free_up_to_lsn, "delivering delayed cut log");
            self.spread_cut_log(cut);
        }
    }

    fn spread_cut_log(&mut self, cut: CutLog) {
        let Some(db) = self.db.as_mut() else {
            return;
        };
        db.index.cut_log(&cut);
        db.huge_keeper.send(HugeKeeperMsg::CutLog(cut));
        for (kind, peer) in &db.peers {
            if kind.wants_cut_log() {
                peer.send(PeerMsg::CutLog(cut));
            }
        }
    }

    // -----------------------------------------------------------------------
    // Topology and replication
    // -----------------------------------------------------------------------

    pub(super) fn handle_generation_change(&mut self, change: GenerationChange) {
        info!(
            vdisk = %self.self_id,
            new_vdisk = %change.vdisk_id,
            generation = change.group.generation,
            "generation change"
        );
        self.self_id = change.vdisk_id;
        self.group = change.group.clone();

        for (id, session) in self.patch_sessions.drain() {
            debug!(%id, "closing patch session");
            session.send(PatchMsg::Poison);
        }
        if let Some(db) = self.db.as_ref() {
            for (_, peer) in &db.peers {
                peer.send(PeerMsg::GenerationChange(change.clone()));
            }
        }
    }

    pub(super) fn handle_commence_repl(&mut self) {
        self.commence_repl_pending = true;
        if let Some(repl) = self.db.as_ref().and_then(|db| db.peer(Subsystem::Repl)) {
            repl.send(PeerMsg::CommenceRepl);
        }
    }

    pub(super) fn handle_repl_done(&mut self) {
        if self.state == SkeletonState::DatabaseError {
            return;
        }
        info!(vdisk = %self.self_id, "replication done");
        self.repl_done = true;
        self.push_status(false);
    }

    pub(super) fn handle_scrub_status(&mut self, has_unreadable: bool) {
        if has_unreadable {
            warn!(vdisk = %self.self_id, "scrub found unreadable blobs");
        }
        self.has_unreadable = has_unreadable;
        self.node.send(NodeMsg::ScrubStatus {
            vdisk_id: self.self_id,
            has_unreadable,
        });
        self.push_status(false);
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    pub(super) const fn readiness(&self) -> VDiskStatus {
        match self.state {
            SkeletonState::LocalRecovery | SkeletonState::SyncGuidRecovery => VDiskStatus::InitPending,
            SkeletonState::Normal if self.repl_done && !self.has_unreadable => VDiskStatus::Ready,
            SkeletonState::Normal => VDiskStatus::Replicating,
            SkeletonState::DatabaseError => VDiskStatus::Error,
        }
    }

    /// Report readiness to the node when it changed; `force` repeats an
    /// unchanged Ready or Replicating
    pub(super) fn push_status(&mut self, force: bool) {
        let status = self.readiness();
        let changed = self.last_status != Some(status);
        let send = match status {
            VDiskStatus::InitPending => false,
            VDiskStatus::Error => changed,
            VDiskStatus::Ready | VDiskStatus::Replicating => changed || force,
        };
        if !send {
            return;
        }
        if changed {
            info!(vdisk = %self.self_id, %status, "readiness changed");
        }
        self.last_status = Some(status);
        self.node.send(NodeMsg::Status {
            vdisk_id: self.self_id,
            status,
        });
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    pub(super) fn handle_poison(&mut self) {
        if self.stopped {
            return;
        }
        let killed = self.active.kill_all();
        for (_, session) in self.patch_sessions.drain() {
            session.send(PatchMsg::Poison);
        }
        let mut abandoned = 0;
        if let Some(db) = self.db.as_mut() {
            for (_, peer) in &db.peers {
                peer.send(PeerMsg::Poison);
            }
            db.log_writer.send(LogWriterMsg::Poison);
            db.huge_keeper.send(HugeKeeperMsg::Poison);
            abandoned = db.overload.abandon();
        }
        self.stopped = true;
        info!(vdisk = %self.self_id, killed, abandoned, "skeleton poisoned");
    }
}
