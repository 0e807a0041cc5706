//! VDisk Skeleton - Control actor of one blob storage unit
//!
//! This crate implements the skeleton of a storage unit including:
//! - Message dispatch gated by the unit's lifecycle state
//! - Write path: validation, index checks, sequence numbers, durability
//! - Overload postponement and out-of-space admission
//! - Read-path query tasks over index snapshots
//! - Compaction control, log cut distribution and readiness reporting
//! - An in-memory index store and a single-node recovery log backend

pub mod active_actors;
pub mod compaction;
pub mod index;
pub mod launcher;
pub mod local;
pub mod logged_rec;
pub mod lsn;
pub mod mem_index;
pub mod messages;
pub mod multi_put;
pub mod oos;
pub mod overload;
pub mod query;
pub mod recovery_log;
pub mod skeleton;
pub mod vault;

// Re-exports
pub use index::{IndexSnapshot, IndexStore, IndexUpdate};
pub use launcher::{LaunchCtx, Subsystem, SubsystemLauncher};
pub use local::LocalLauncher;
pub use mem_index::MemIndexStore;
pub use messages::{Addr, ClientRequest, NodeMsg, Reply, ReplyTo, Response, SkeletonMsg};
pub use oos::OutOfSpaceState;
pub use recovery_log::{RecoveryLog, SyncMode};
pub use skeleton::{Skeleton, SkeletonState, accepts};
