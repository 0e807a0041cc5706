//! Registry of short-lived tasks spawned by the skeleton
//!
//! Query tasks and multi-put collectors report `ActorDied` to the skeleton
//! when they finish so the registry can forget them. On shutdown every task
//! still registered is aborted.

use crate::messages::{Addr, SkeletonMsg};
use std::collections::HashMap;
use std::future::Future;
use tokio::task::AbortHandle;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ActiveActors {
    next_id: u64,
    tasks: HashMap<u64, AbortHandle>,
}

impl ActiveActors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `fut` as a tracked task. `skeleton` receives `ActorDied` with
    /// the returned id once it completes.
    pub fn spawn<F>(&mut self, skeleton: Addr<SkeletonMsg>, fut: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.next_id += 1;
        let id = self.next_id;
        let handle = tokio::spawn(async move {
            fut.await;
            skeleton.send(SkeletonMsg::ActorDied(id));
        });
        self.tasks.insert(id, handle.abort_handle());
        id
    }

    /// Forget a finished task
    pub fn erase(&mut self, id: u64) -> bool {
        self.tasks.remove(&id).is_some()
    }

    /// Abort every registered task
    pub fn kill_all(&mut self) -> usize {
        let count = self.tasks.len();
        for (id, handle) in self.tasks.drain() {
            debug!(id, "aborting active actor");
            handle.abort();
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
