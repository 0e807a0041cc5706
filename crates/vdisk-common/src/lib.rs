//! VDisk Common - Shared types and utilities
//!
//! This crate provides the identity, sequence-number and status types,
//! error definitions and configuration used by the skeleton actor, its
//! collaborators and the node binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BacklogConfig, VDiskConfig};
pub use error::{Error, Result};
pub use types::*;
