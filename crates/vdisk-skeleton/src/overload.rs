//! Overload handling for write-class requests
//!
//! When background compaction falls behind, fresh writes are parked in an
//! emergency queue instead of adding to the backlog, and the disk scheduler
//! is told to shift weight towards compaction.
//!
//! # Components
//!
//! - **PostponedEvent**: a parked request, one variant per postponable kind
//! - **EmergencyQueue**: FIFO of parked requests, drained in batches
//! - **SchedulerWeights**: compaction weights sent to the log writer's
//!   disk scheduler, derived from the backlog rank of each partition
//!
//! Out-of-space rejection happens before any of this: a request the space
//! tracker forbids is never parked.

use crate::index::Backlog;
use crate::messages::{
    Addr, AnubisOsirisPut, ClientRequest, LocalSyncData, LogWriterMsg, MultiPutRequest, PutRequest, ReplyTo,
    SkeletonMsg,
};
use std::collections::VecDeque;
use tracing::{debug, trace};
use vdisk_common::{BacklogConfig, HullDbMask, HullDbType, VDiskConfig};

/// Highest compaction weight handed to the scheduler
pub const MAX_COMPACTION_WEIGHT: u32 = 16;

/// A request captured while the unit is overloaded
#[derive(Debug)]
pub enum PostponedEvent {
    Put(PutRequest, ReplyTo),
    MultiPut(MultiPutRequest, ReplyTo),
    LocalSyncData(LocalSyncData, ReplyTo),
    AnubisOsirisPut(AnubisOsirisPut, ReplyTo),
}

impl PostponedEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Put(..) => "Put",
            Self::MultiPut(..) => "MultiPut",
            Self::LocalSyncData(..) => "LocalSyncData",
            Self::AnubisOsirisPut(..) => "AnubisOsirisPut",
        }
    }
}

impl From<PostponedEvent> for SkeletonMsg {
    fn from(ev: PostponedEvent) -> Self {
        match ev {
            PostponedEvent::Put(req, reply) => Self::client(ClientRequest::Put(req), reply),
            PostponedEvent::MultiPut(req, reply) => Self::client(ClientRequest::MultiPut(req), reply),
            PostponedEvent::LocalSyncData(data, reply) => Self::LocalSyncData(data, reply),
            PostponedEvent::AnubisOsirisPut(put, reply) => Self::AnubisOsirisPut(put, reply),
        }
    }
}

/// Result of offering a request to the overload handler
#[derive(Debug)]
pub enum Admission {
    /// Process the request now
    Proceed(PostponedEvent),
    /// Parked; `kick` asks the caller to schedule a drain pass right away
    /// because the queue is only non-empty, not overloaded
    Postponed { kick: bool },
}

/// Compaction weight per partition, 1 when there is no backlog
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerWeights {
    pub logo_blobs: u32,
    pub blocks: u32,
    pub barriers: u32,
}

impl Default for SchedulerWeights {
    fn default() -> Self {
        Self {
            logo_blobs: 1,
            blocks: 1,
            barriers: 1,
        }
    }
}

impl SchedulerWeights {
    fn set(&mut self, db: HullDbType, weight: u32) {
        match db {
            HullDbType::LogoBlobs => self.logo_blobs = weight,
            HullDbType::Blocks => self.blocks = weight,
            HullDbType::Barriers => self.barriers = weight,
        }
    }
}

const fn threshold(config: &BacklogConfig, db: HullDbType) -> u64 {
    match db {
        HullDbType::LogoBlobs => config.logo_blobs,
        HullDbType::Blocks => config.blocks,
        HullDbType::Barriers => config.barriers,
    }
}

/// Weight for one partition: grows by one every quarter of the threshold
fn weight_for(backlog: u64, threshold: u64) -> u32 {
    let steps = backlog.saturating_mul(4) / threshold.max(1);
    u32::try_from(steps)
        .unwrap_or(u32::MAX)
        .saturating_add(1)
        .min(MAX_COMPACTION_WEIGHT)
}

pub struct OverloadHandler {
    queue: VecDeque<PostponedEvent>,
    thresholds: BacklogConfig,
    batch_size: usize,
    weights: Option<SchedulerWeights>,
    log_writer: Addr<LogWriterMsg>,
}

impl OverloadHandler {
    #[must_use]
    pub fn new(config: &VDiskConfig, log_writer: Addr<LogWriterMsg>) -> Self {
        Self {
            queue: VecDeque::new(),
            thresholds: config.backlog,
            batch_size: config.emergency_batch_size,
            weights: None,
            log_writer,
        }
    }

    /// Any partition at or above its backlog threshold
    #[must_use]
    pub fn overloaded(&self, backlog: &Backlog) -> bool {
        HullDbType::ALL
            .iter()
            .any(|db| backlog.get(*db) >= threshold(&self.thresholds, *db))
    }

    /// Park `ev` if the queue already holds events (order is FIFO) or the
    /// backlog is over threshold; otherwise hand it back for processing
    pub fn postpone_event(&mut self, ev: PostponedEvent, backlog: &Backlog) -> Admission {
        let overloaded = self.overloaded(backlog);
        if self.queue.is_empty() && !overloaded {
            return Admission::Proceed(ev);
        }
        debug!(
            event = ev.name(),
            queued = self.queue.len(),
            overloaded,
            "postponing write"
        );
        self.queue.push_back(ev);
        Admission::Postponed { kick: !overloaded }
    }

    /// Next event to process, if the backlog allows draining
    pub fn pop_postponed(&mut self, backlog: &Backlog) -> Option<PostponedEvent> {
        if self.overloaded(backlog) {
            return None;
        }
        self.queue.pop_front()
    }

    /// Events drained per pass
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Recompute scheduler weights for the partitions in `mask` and send
    /// them to the log writer if they changed (or `force` is set).
    /// Returns whether a `ConfigureScheduler` was sent.
    pub fn actualize_weights(&mut self, backlog: &Backlog, mask: HullDbMask, force: bool) -> bool {
        let mut weights = self.weights.unwrap_or_default();
        for db in mask.iter() {
            weights.set(db, weight_for(backlog.get(db), threshold(&self.thresholds, db)));
        }
        if !force && self.weights == Some(weights) {
            return false;
        }
        trace!(?weights, force, "configuring scheduler");
        self.weights = Some(weights);
        self.log_writer.send(LogWriterMsg::ConfigureScheduler(weights));
        true
    }

    #[must_use]
    pub const fn weights(&self) -> Option<SchedulerWeights> {
        self.weights
    }

    /// Drop every parked event. Their requesters get no reply.
    pub fn abandon(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Reply;
    use bytes::Bytes;
    use tokio::sync::mpsc::UnboundedReceiver;
    use vdisk_common::{LogoBlobId, VDiskId};

    fn handler() -> (OverloadHandler, UnboundedReceiver<LogWriterMsg>) {
        let config = VDiskConfig {
            backlog: BacklogConfig {
                logo_blobs: 4,
                blocks: 4,
                barriers: 4,
            },
            ..VDiskConfig::default()
        };
        let (addr, rx) = Addr::channel();
        (OverloadHandler::new(&config, addr), rx)
    }

    fn put(step: u32) -> PostponedEvent {
        let (addr, _rx) = Addr::<Reply>::channel();
        PostponedEvent::Put(
            PutRequest {
                vdisk_id: VDiskId::default(),
                id: LogoBlobId::new(1, 1, step, 0, 1, 0).with_part(1),
                data: Bytes::from_static(b"x"),
                ignore_block: false,
            },
            ReplyTo::new(addr, u64::from(step)),
        )
    }

    fn step_of(ev: &PostponedEvent) -> u32 {
        match ev {
            PostponedEvent::Put(req, _) => req.id.step,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_proceed_when_idle() {
        let (mut overload, _rx) = handler();
        let admission = overload.postpone_event(put(1), &Backlog::default());
        assert!(matches!(admission, Admission::Proceed(_)));
        assert!(overload.is_empty());
    }

    #[test]
    fn test_postpone_and_drain_fifo() {
        let (mut overload, _rx) = handler();
        let busy = Backlog {
            logo_blobs: 4,
            ..Backlog::default()
        };
        for step in 1..=3 {
            let admission = overload.postpone_event(put(step), &busy);
            assert!(matches!(admission, Admission::Postponed { kick: false }));
        }
        assert_eq!(overload.queue_len(), 3);
        assert!(overload.pop_postponed(&busy).is_none());

        // Queue non-empty keeps FIFO even once the backlog clears
        let idle = Backlog::default();
        let admission = overload.postpone_event(put(4), &idle);
        assert!(matches!(admission, Admission::Postponed { kick: true }));

        let order: Vec<u32> = std::iter::from_fn(|| overload.pop_postponed(&idle))
            .map(|ev| step_of(&ev))
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_weights_sent_on_change() {
        let (mut overload, mut rx) = handler();
        let idle = Backlog::default();
        assert!(overload.actualize_weights(&idle, HullDbMask::ALL, true));
        assert!(matches!(
            rx.try_recv(),
            Ok(LogWriterMsg::ConfigureScheduler(w)) if w == SchedulerWeights::default()
        ));

        // Unchanged weights are not resent
        assert!(!overload.actualize_weights(&idle, HullDbMask::LOGO_BLOBS, false));
        assert!(rx.try_recv().is_err());

        let busy = Backlog {
            logo_blobs: 2,
            blocks: 100,
            barriers: 0,
        };
        assert!(overload.actualize_weights(&busy, HullDbMask::LOGO_BLOBS, false));
        let weights = overload.weights().unwrap();
        assert_eq!(weights.logo_blobs, 3);
        // blocks not in the mask, left alone
        assert_eq!(weights.blocks, 1);

        overload.actualize_weights(&busy, HullDbMask::BLOCKS, false);
        assert_eq!(overload.weights().unwrap().blocks, MAX_COMPACTION_WEIGHT);
    }

    #[test]
    fn test_abandon() {
        let (mut overload, _rx) = handler();
        let busy = Backlog {
            barriers: 10,
            ..Backlog::default()
        };
        overload.postpone_event(put(1), &busy);
        overload.postpone_event(put(2), &busy);
        assert_eq!(overload.abandon(), 2);
        assert!(overload.is_empty());
    }
}
