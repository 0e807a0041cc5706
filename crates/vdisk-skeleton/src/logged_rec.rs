//! Records of writes waiting for durability
//!
//! A `LoggedRecord` is built when a write path submits its log entry and
//! lives in the vault until the log writer confirms it. Replaying it applies
//! the update to the index and sends the reply the requester is waiting for.

use crate::index::{GcCmd, IndexStore, IndexUpdate, SyncData};
use crate::messages::{
    Addr, BlockResult, CollectGarbageResult, HugeKeeperMsg, HugeReply, MessageKind, MultiPutItemResult,
    PutResult, ReplyTo, Response,
};
use bytes::Bytes;
use vdisk_common::{DiskPart, LogoBlobId, LsnSeg, OutOfSpaceFlags, ReplyStatus};

#[derive(Debug)]
pub enum LoggedRecordKind {
    Put {
        id: LogoBlobId,
        data: Bytes,
        reply: ReplyTo,
    },
    /// One item of a multi-put; the reply goes to the batch collector
    MultiPutItem {
        id: LogoBlobId,
        idx: usize,
        data: Bytes,
        collector: ReplyTo,
    },
    HugeBlob {
        id: LogoBlobId,
        placement: DiskPart,
        write_id: u64,
        reply: HugeReply,
    },
    Block {
        tablet_id: u64,
        generation: u32,
        issuer_guid: u64,
        reply: ReplyTo,
    },
    CollectGarbage {
        cmd: GcCmd,
        reply: ReplyTo,
    },
    LocalSyncData {
        data: SyncData,
        reply: ReplyTo,
    },
    AnubisOsirisPut {
        id: LogoBlobId,
        reply: ReplyTo,
    },
    Phantoms {
        ids: Vec<LogoBlobId>,
        reply: ReplyTo,
    },
    HandoffDel {
        id: LogoBlobId,
        reply: ReplyTo,
    },
}

#[derive(Debug)]
pub struct LoggedRecord {
    pub seg: LsnSeg,
    /// The segment was allocated on the sync log too
    pub confirm_sync_log: bool,
    pub kind: LoggedRecordKind,
}

/// What replay may touch
pub struct ReplayCtx<'a> {
    pub index: &'a mut dyn IndexStore,
    pub huge_keeper: &'a Addr<HugeKeeperMsg>,
    pub oos: OutOfSpaceFlags,
}

impl LoggedRecord {
    #[must_use]
    pub const fn new(seg: LsnSeg, confirm_sync_log: bool, kind: LoggedRecordKind) -> Self {
        Self {
            seg,
            confirm_sync_log,
            kind,
        }
    }

    /// The durable state change this record carries
    #[must_use]
    pub fn update(&self) -> IndexUpdate {
        match &self.kind {
            LoggedRecordKind::Put { id, data, .. } | LoggedRecordKind::MultiPutItem { id, data, .. } => {
                IndexUpdate::LogoBlob {
                    id: *id,
                    data: data.clone(),
                }
            }
            LoggedRecordKind::HugeBlob { id, placement, .. } => IndexUpdate::HugeBlob {
                id: *id,
                placement: *placement,
            },
            LoggedRecordKind::Block {
                tablet_id,
                generation,
                issuer_guid,
                ..
            } => IndexUpdate::Block {
                tablet_id: *tablet_id,
                generation: *generation,
                issuer_guid: *issuer_guid,
            },
            LoggedRecordKind::CollectGarbage { cmd, .. } => IndexUpdate::CollectGarbage(cmd.clone()),
            LoggedRecordKind::LocalSyncData { data, .. } => IndexUpdate::SyncData(data.clone()),
            LoggedRecordKind::AnubisOsirisPut { id, .. } => IndexUpdate::AnubisOsirisPut { id: *id },
            LoggedRecordKind::Phantoms { ids, .. } => IndexUpdate::Phantoms { ids: ids.clone() },
            LoggedRecordKind::HandoffDel { id, .. } => IndexUpdate::HandoffDel { id: *id },
        }
    }

    /// Apply the record to the index and finish the write. The segment
    /// must already be confirmed durable.
    pub fn replay(self, ctx: &mut ReplayCtx<'_>) {
        ctx.index.apply(self.update(), self.seg);
        let ok = ReplyStatus::Ok;

        match self.kind {
            LoggedRecordKind::Put { id, reply, .. } => reply.send(Response::Put(PutResult {
                status: ok,
                reason: String::new(),
                id,
                oos: ctx.oos,
            })),
            LoggedRecordKind::MultiPutItem { id, idx, collector, .. } => {
                collector.send(Response::MultiPutItem(MultiPutItemResult {
                    id,
                    idx,
                    status: ok,
                    reason: String::new(),
                }));
            }
            LoggedRecordKind::HugeBlob {
                id,
                placement,
                write_id,
                reply,
            } => {
                ctx.huge_keeper.send(HugeKeeperMsg::Logged {
                    write_id,
                    placement,
                    lsn: self.seg.last,
                    slot_is_used: true,
                });
                reply.to.send(reply.response(id, ok, "", ctx.oos));
            }
            LoggedRecordKind::Block {
                tablet_id,
                generation,
                reply,
                ..
            } => reply.send(Response::Block(BlockResult {
                status: ok,
                reason: String::new(),
                tablet_id,
                actual_generation: Some(generation),
            })),
            LoggedRecordKind::CollectGarbage { cmd, reply } => {
                reply.send(Response::CollectGarbage(CollectGarbageResult {
                    status: ok,
                    reason: String::new(),
                    tablet_id: cmd.tablet_id,
                    record_generation: cmd.record_generation,
                    per_generation_counter: cmd.per_generation_counter,
                    channel: cmd.channel,
                }));
            }
            LoggedRecordKind::LocalSyncData { reply, .. } => {
                reply.send(Response::internal(MessageKind::LocalSyncData, ok, ""));
            }
            LoggedRecordKind::AnubisOsirisPut { reply, .. } => {
                reply.send(Response::internal(MessageKind::AnubisOsirisPut, ok, ""));
            }
            LoggedRecordKind::Phantoms { reply, .. } => {
                reply.send(Response::internal(MessageKind::DetectedPhantomBlob, ok, ""));
            }
            LoggedRecordKind::HandoffDel { reply, .. } => {
                reply.send(Response::internal(MessageKind::DelLogoBlobDataSyncLog, ok, ""));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem_index::MemIndexStore;
    use crate::messages::{HugeReplyKind, Reply};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn reply_to() -> (ReplyTo, UnboundedReceiver<Reply>) {
        let (addr, rx) = Addr::channel();
        (ReplyTo::new(addr, 5), rx)
    }

    #[test]
    fn test_put_replay_applies_and_replies() {
        let mut index = MemIndexStore::new();
        let (keeper, _keeper_rx) = Addr::channel();
        let (reply, mut rx) = reply_to();
        let id = LogoBlobId::new(9, 1, 1, 0, 3, 0).with_part(1);

        let record = LoggedRecord::new(
            LsnSeg::point(1),
            true,
            LoggedRecordKind::Put {
                id,
                data: Bytes::from_static(b"abc"),
                reply,
            },
        );
        assert!(matches!(record.update(), IndexUpdate::LogoBlob { .. }));
        record.replay(&mut ReplayCtx {
            index: &mut index,
            huge_keeper: &keeper,
            oos: OutOfSpaceFlags::YELLOW,
        });

        let reply = rx.try_recv().unwrap();
        assert_eq!(reply.cookie, 5);
        let Response::Put(result) = reply.response else {
            panic!("expected put result");
        };
        assert_eq!(result.status, ReplyStatus::Ok);
        assert_eq!(result.oos, OutOfSpaceFlags::YELLOW);
        assert!(index.take_snapshot().get(&id).is_some());
    }

    #[test]
    fn test_huge_replay_notifies_keeper() {
        let mut index = MemIndexStore::new();
        let (keeper, mut keeper_rx) = Addr::channel();
        let (to, mut rx) = reply_to();
        let id = LogoBlobId::new(9, 1, 2, 0, 100, 0).with_part(1);
        let placement = DiskPart::new(1, 0, 100);

        LoggedRecord::new(
            LsnSeg::point(4),
            true,
            LoggedRecordKind::HugeBlob {
                id,
                placement,
                write_id: 77,
                reply: HugeReply {
                    to,
                    kind: HugeReplyKind::MultiPutItem { idx: 2 },
                },
            },
        )
        .replay(&mut ReplayCtx {
            index: &mut index,
            huge_keeper: &keeper,
            oos: OutOfSpaceFlags::NONE,
        });

        match keeper_rx.try_recv().unwrap() {
            HugeKeeperMsg::Logged {
                write_id,
                lsn,
                slot_is_used,
                ..
            } => {
                assert_eq!(write_id, 77);
                assert_eq!(lsn, 4);
                assert!(slot_is_used);
            }
            other => panic!("unexpected keeper message {other:?}"),
        }
        let reply = rx.try_recv().unwrap();
        assert!(matches!(reply.response, Response::MultiPutItem(ref r) if r.idx == 2));
    }
}
