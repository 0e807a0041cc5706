//! Single-node collaborators
//!
//! `LocalLauncher` backs the skeleton with tasks that need no peers: a log
//! writer appending to the on-disk [`RecoveryLog`], a large-object keeper
//! appending payloads to a blob file, and peer subsystems that complete
//! their handshakes at once (guid recovery trusts the local log, replication
//! has nothing to fetch, scrub finds nothing unreadable).

use crate::index::Backlog;
use crate::launcher::{LaunchCtx, Subsystem, SubsystemLauncher};
use crate::mem_index::MemIndexStore;
use crate::messages::{
    Addr, HugeKeeperMsg, HugeWrite, HullLogHugeBlob, LocalRecoveryDone, LogResult, LogStatus, LogWriterMsg,
    LoggedEntry, PatchMsg, PatchResult, PatchStart, PeerMsg, Response, SkeletonMsg, SyncGuidRecoveryDone,
};
use crate::oos::OutOfSpaceState;
use crate::recovery_log::{LogRecord, RecoveryLog, SyncMode};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, trace, warn};
use vdisk_common::{DiskPart, Error, Lsn, OutOfSpaceFlags, ReplyStatus, Result, VDiskConfig};

const RECOVERY_LOG_FILE: &str = "vdisk.log";
const HUGE_BLOB_FILE: &str = "huge.dat";

/// Chunk size used to express keeper file offsets as placements
const HUGE_CHUNK_SIZE: u64 = 128 << 20;

pub struct LocalLauncher {
    log: Arc<RecoveryLog>,
    huge_file: Arc<Mutex<File>>,
}

impl LocalLauncher {
    /// Open the unit's files under `dir` and replay the recovery log
    pub fn open(dir: impl AsRef<Path>, config: &VDiskConfig, sync_mode: SyncMode) -> Result<(Self, LocalRecoveryDone)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let (log, replay) = RecoveryLog::open(dir.join(RECOVERY_LOG_FILE), sync_mode)?;
        let huge_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(HUGE_BLOB_FILE))?;

        let fresh_limit = Backlog {
            logo_blobs: (config.backlog.logo_blobs / 2).max(1),
            blocks: (config.backlog.blocks / 2).max(1),
            barriers: (config.backlog.barriers / 2).max(1),
        };
        let entries = replay.entries.len();
        let index = MemIndexStore::with_fresh_limit(fresh_limit).recover(replay.entries);
        info!(
            dir = %dir.display(),
            entries,
            recovered_lsn = replay.last_lsn,
            clean = replay.clean,
            "local recovery finished"
        );

        let done = LocalRecoveryDone {
            ok: true,
            reason: String::new(),
            index: Some(Box::new(index)),
            recovered_lsn: replay.last_lsn,
            space: OutOfSpaceState::new(),
        };
        Ok((
            Self {
                log: Arc::new(log),
                huge_file: Arc::new(Mutex::new(huge_file)),
            },
            done,
        ))
    }
}

async fn run_log_writer(log: Arc<RecoveryLog>, skeleton: Addr<SkeletonMsg>, mut rx: UnboundedReceiver<LogWriterMsg>) {
    let mut last_lsn: Lsn = 0;
    while let Some(msg) = rx.recv().await {
        match msg {
            LogWriterMsg::Log(entries) => {
                let logged: Vec<LoggedEntry> = entries
                    .iter()
                    .map(|e| LoggedEntry {
                        handle: e.handle,
                        seg: e.seg,
                    })
                    .collect();
                last_lsn = entries.iter().map(|e| e.seg.last).fold(last_lsn, Lsn::max);

                let log = Arc::clone(&log);
                let written = tokio::task::spawn_blocking(move || {
                    let records = entries
                        .iter()
                        .map(|e| LogRecord::entry(e.seg, &e.update))
                        .collect::<Result<Vec<_>>>()?;
                    log.append(&records)
                })
                .await
                .map_err(|e| Error::internal(e.to_string()))
                .and_then(|r| r);

                let status = match written {
                    Ok(()) => LogStatus::Ok,
                    Err(e) => {
                        error!(error = %e, "recovery log append failed");
                        LogStatus::Error(e.to_string())
                    }
                };
                skeleton.send(SkeletonMsg::LogResult(LogResult {
                    status,
                    entries: logged,
                }));
            }
            LogWriterMsg::ConfigureScheduler(weights) => {
                trace!(?weights, "scheduler weights");
                skeleton.send(SkeletonMsg::ConfigureSchedulerResult {
                    ok: true,
                    reason: String::new(),
                });
            }
            LogWriterMsg::Poison => break,
        }
    }

    let log = Arc::clone(&log);
    match tokio::task::spawn_blocking(move || log.checkpoint(last_lsn)).await {
        Ok(Ok(())) => debug!(last_lsn, "recovery log checkpointed"),
        Ok(Err(e)) => warn!(error = %e, "recovery log checkpoint failed"),
        Err(e) => warn!(error = %e, "recovery log checkpoint task failed"),
    }
}

fn append_huge(file: &Mutex<File>, data: &[u8]) -> Result<DiskPart> {
    let mut file = file.lock();
    let offset = file.metadata()?.len();
    file.write_all(data)?;
    file.sync_data()?;
    let size = u32::try_from(data.len()).map_err(|_| Error::storage("huge blob exceeds 4 GiB"))?;
    let chunk_idx = u32::try_from(offset / HUGE_CHUNK_SIZE).map_err(|_| Error::storage("huge blob file is full"))?;
    Ok(DiskPart::new(chunk_idx, (offset % HUGE_CHUNK_SIZE) as u32, size))
}

async fn run_huge_keeper(file: Arc<Mutex<File>>, skeleton: Addr<SkeletonMsg>, mut rx: UnboundedReceiver<HugeKeeperMsg>) {
    let mut next_write_id = 0u64;
    while let Some(msg) = rx.recv().await {
        match msg {
            HugeKeeperMsg::Write(HugeWrite {
                id,
                data,
                ignore_block,
                reply,
            }) => {
                next_write_id += 1;
                let file = Arc::clone(&file);
                let written = tokio::task::spawn_blocking(move || append_huge(&file, &data))
                    .await
                    .map_err(|e| Error::internal(e.to_string()))
                    .and_then(|r| r);
                match written {
                    Ok(placement) => {
                        skeleton.send(SkeletonMsg::HullLogHugeBlob(HullLogHugeBlob {
                            write_id: next_write_id,
                            id,
                            placement,
                            ignore_block,
                            reply,
                        }));
                    }
                    Err(e) => {
                        error!(%id, error = %e, "huge blob write failed");
                        reply.to.send(reply.response(
                            id,
                            ReplyStatus::Error,
                            e.to_string(),
                            OutOfSpaceFlags::NONE,
                        ));
                    }
                }
            }
            HugeKeeperMsg::Logged {
                write_id,
                placement,
                lsn,
                slot_is_used,
            } => {
                trace!(write_id, ?placement, lsn, slot_is_used, "huge blob logged");
            }
            HugeKeeperMsg::CutLog(cut) => trace!(free_up_to_lsn = cut.free_up_to_lsn, "huge keeper log cut"),
            HugeKeeperMsg::Poison => break,
        }
    }
}

async fn run_subsystem(
    kind: Subsystem,
    skeleton: Addr<SkeletonMsg>,
    recovered_lsn: Lsn,
    mut rx: UnboundedReceiver<PeerMsg>,
) {
    match kind {
        Subsystem::Syncer => {
            skeleton.send(SkeletonMsg::SyncGuidRecoveryDone(SyncGuidRecoveryDone {
                ok: true,
                db_birth_lsn: recovered_lsn,
            }));
        }
        Subsystem::Repl => {
            skeleton.send(SkeletonMsg::ReplDone);
        }
        Subsystem::Scrub => {
            skeleton.send(SkeletonMsg::ScrubStatus { has_unreadable: false });
        }
        _ => {}
    }

    while let Some(msg) = rx.recv().await {
        match msg {
            PeerMsg::GenerationChange(change) => {
                debug!(%kind, vdisk_id = %change.vdisk_id, "generation change");
            }
            PeerMsg::CutLog(cut) => trace!(%kind, free_up_to_lsn = cut.free_up_to_lsn, "log cut"),
            PeerMsg::CommenceRepl if kind == Subsystem::Repl => {
                skeleton.send(SkeletonMsg::ReplDone);
            }
            PeerMsg::CommenceRepl => {}
            PeerMsg::Poison => break,
        }
    }
    trace!(%kind, "subsystem stopped");
}

/// Patch session: acknowledges diffs and closes itself after the final one
async fn run_patch_session(start: PatchStart, skeleton: Addr<SkeletonMsg>, mut rx: UnboundedReceiver<PatchMsg>) {
    let mut applied = 0usize;
    while let Some(msg) = rx.recv().await {
        let PatchMsg::Diff(diff, reply) = msg else {
            break;
        };
        applied += diff.data.len();
        reply.send(Response::Patch(PatchResult {
            status: ReplyStatus::Ok,
            reason: String::new(),
            original_id: start.original_id,
        }));
        if diff.is_final {
            debug!(original = %start.original_id, patched = %start.patched_id, applied, "patch finished");
            skeleton.send(SkeletonMsg::PatchDying(start.original_id));
            break;
        }
    }
}

impl SubsystemLauncher for LocalLauncher {
    fn log_writer(&mut self, ctx: &LaunchCtx<'_>) -> Addr<LogWriterMsg> {
        let (addr, rx) = Addr::channel();
        tokio::spawn(run_log_writer(Arc::clone(&self.log), ctx.skeleton.clone(), rx));
        addr
    }

    fn huge_keeper(&mut self, ctx: &LaunchCtx<'_>) -> Addr<HugeKeeperMsg> {
        let (addr, rx) = Addr::channel();
        tokio::spawn(run_huge_keeper(Arc::clone(&self.huge_file), ctx.skeleton.clone(), rx));
        addr
    }

    fn subsystem(&mut self, kind: Subsystem, ctx: &LaunchCtx<'_>) -> Addr<PeerMsg> {
        let (addr, rx) = Addr::channel();
        tokio::spawn(run_subsystem(kind, ctx.skeleton.clone(), ctx.recovered_lsn, rx));
        addr
    }

    fn patch_session(&mut self, start: &PatchStart, ctx: &LaunchCtx<'_>) -> Addr<PatchMsg> {
        let (addr, rx) = Addr::channel();
        tokio::spawn(run_patch_session(*start, ctx.skeleton.clone(), rx));
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexUpdate;
    use crate::logged_rec::{LoggedRecord, LoggedRecordKind};
    use crate::messages::{LogEntry, Reply, ReplyTo};
    use crate::vault::LoggedRecsVault;
    use bytes::Bytes;
    use tempfile::tempdir;
    use vdisk_common::{ErasureSpecies, GroupInfo, LogoBlobId, LsnSeg, VDiskId};

    #[tokio::test]
    async fn test_log_writer_persists_and_confirms() {
        let dir = tempdir().unwrap();
        let config = Arc::new(VDiskConfig::default());
        let id = LogoBlobId::new(1, 1, 1, 0, 3, 0).with_part(1);

        let (mut launcher, done) = LocalLauncher::open(dir.path(), &config, SyncMode::Never).unwrap();
        assert!(done.ok);
        assert_eq!(done.recovered_lsn, 0);

        let (skeleton, mut skeleton_rx) = Addr::channel();
        let group = Arc::new(GroupInfo::new(0, 1, ErasureSpecies::None));
        let space = OutOfSpaceState::new();
        let ctx = LaunchCtx {
            skeleton: &skeleton,
            vdisk_id: VDiskId::default(),
            group: &group,
            config: &config,
            recovered_lsn: 0,
            space: &space,
        };
        let writer = launcher.log_writer(&ctx);

        let (reply_addr, _reply_rx) = Addr::<Reply>::channel();
        let mut vault = LoggedRecsVault::new();
        let update = IndexUpdate::LogoBlob {
            id,
            data: Bytes::from_static(b"abc"),
        };
        let handle = vault.put(LoggedRecord::new(
            LsnSeg::point(1),
            true,
            LoggedRecordKind::Put {
                id,
                data: Bytes::from_static(b"abc"),
                reply: ReplyTo::new(reply_addr, 0),
            },
        ));
        writer.send(LogWriterMsg::Log(vec![LogEntry {
            handle,
            seg: LsnSeg::point(1),
            confirm_sync_log: true,
            update,
        }]));

        match skeleton_rx.recv().await.unwrap() {
            SkeletonMsg::LogResult(result) => {
                assert_eq!(result.status, LogStatus::Ok);
                assert_eq!(result.entries.len(), 1);
                assert_eq!(result.entries[0].handle, handle);
            }
            other => panic!("unexpected message {other:?}"),
        }
        writer.send(LogWriterMsg::Poison);

        // The writer checkpoints on poison and drops its mailbox when done
        while !writer.is_closed() {
            tokio::task::yield_now().await;
        }

        let (_launcher, done) = LocalLauncher::open(dir.path(), &config, SyncMode::Never).unwrap();
        assert_eq!(done.recovered_lsn, 1);
        let snapshot = done.index.unwrap().take_snapshot();
        assert!(snapshot.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_syncer_reports_birth_lsn() {
        let dir = tempdir().unwrap();
        let config = Arc::new(VDiskConfig::default());
        let (mut launcher, _done) = LocalLauncher::open(dir.path(), &config, SyncMode::Never).unwrap();

        let (skeleton, mut skeleton_rx) = Addr::channel();
        let group = Arc::new(GroupInfo::new(0, 1, ErasureSpecies::None));
        let space = OutOfSpaceState::new();
        let ctx = LaunchCtx {
            skeleton: &skeleton,
            vdisk_id: VDiskId::default(),
            group: &group,
            config: &config,
            recovered_lsn: 17,
            space: &space,
        };
        let syncer = launcher.subsystem(Subsystem::Syncer, &ctx);
        match skeleton_rx.recv().await.unwrap() {
            SkeletonMsg::SyncGuidRecoveryDone(done) => {
                assert!(done.ok);
                assert_eq!(done.db_birth_lsn, 17);
            }
            other => panic!("unexpected message {other:?}"),
        }
        syncer.send(PeerMsg::Poison);
    }
}
