//! Configuration types for the VDisk skeleton
//!
//! Every field has a default so a partial TOML section is enough.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration of one storage unit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VDiskConfig {
    /// Largest blob part payload accepted by put (bytes)
    pub max_logo_blob_data_size: u32,
    /// Parts at least this large are written through the large-object keeper
    pub min_huge_blob_size: u32,
    /// Postponed events drained per emergency queue pass
    pub emergency_batch_size: usize,
    /// Period of the emergency queue wakeup timer
    pub emergency_wakeup_ms: u64,
    /// Period of the readiness push to the node
    pub status_push_interval_ms: u64,
    /// Compaction backlog at which writes start being postponed
    pub backlog: BacklogConfig,
    /// Maximum number of extreme queries in one get
    pub max_get_queries: usize,
    /// Run quorum/guid recovery against peers before serving
    pub run_syncer: bool,
    /// Run peer replication after guid recovery
    pub run_repl: bool,
    /// Run handoff proxies
    pub run_handoff: bool,
    /// Run the anubis/osiris repair worker
    pub run_anubis: bool,
    /// Run the defragmentation worker
    pub run_defrag: bool,
    /// This unit is a donor being drained into its replacement
    pub donor_mode: bool,
}

impl Default for VDiskConfig {
    fn default() -> Self {
        Self {
            max_logo_blob_data_size: 10 << 20,
            min_huge_blob_size: 512 << 10,
            emergency_batch_size: 16,
            emergency_wakeup_ms: 50,
            status_push_interval_ms: 1000,
            backlog: BacklogConfig::default(),
            max_get_queries: 10_000,
            run_syncer: true,
            run_repl: true,
            run_handoff: false,
            run_anubis: false,
            run_defrag: false,
            donor_mode: false,
        }
    }
}

impl VDiskConfig {
    #[must_use]
    pub const fn emergency_wakeup_interval(&self) -> Duration {
        Duration::from_millis(self.emergency_wakeup_ms)
    }

    #[must_use]
    pub const fn status_push_interval(&self) -> Duration {
        Duration::from_millis(self.status_push_interval_ms)
    }

    /// Check the values are usable together
    pub fn validate(&self) -> Result<()> {
        if self.emergency_batch_size == 0 {
            return Err(Error::configuration("emergency_batch_size must be positive"));
        }
        if self.emergency_wakeup_ms == 0 || self.status_push_interval_ms == 0 {
            return Err(Error::configuration("timer intervals must be positive"));
        }
        if self.max_get_queries == 0 {
            return Err(Error::configuration("max_get_queries must be positive"));
        }
        if self.min_huge_blob_size > self.max_logo_blob_data_size {
            return Err(Error::configuration(format!(
                "min_huge_blob_size {} exceeds max_logo_blob_data_size {}",
                self.min_huge_blob_size, self.max_logo_blob_data_size
            )));
        }
        self.backlog.validate()
    }
}

/// Per-partition compaction backlog thresholds
///
/// Backlog is measured in uncompacted fresh segments. A partition at or above
/// its threshold turns on write postponement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    pub logo_blobs: u64,
    pub blocks: u64,
    pub barriers: u64,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            logo_blobs: 256,
            blocks: 64,
            barriers: 64,
        }
    }
}

impl BacklogConfig {
    fn validate(&self) -> Result<()> {
        if self.logo_blobs == 0 || self.blocks == 0 || self.barriers == 0 {
            return Err(Error::configuration("backlog thresholds must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = VDiskConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.emergency_batch_size, 16);
        assert_eq!(config.emergency_wakeup_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_toml() {
        let config: VDiskConfig = toml::from_str(
            r"
            min_huge_blob_size = 4096
            run_syncer = false

            [backlog]
            logo_blobs = 8
            ",
        )
        .unwrap();
        assert_eq!(config.min_huge_blob_size, 4096);
        assert!(!config.run_syncer);
        assert_eq!(config.backlog.logo_blobs, 8);
        assert_eq!(config.backlog.blocks, 64);
        assert_eq!(config.max_logo_blob_data_size, 10 << 20);
    }

    #[test]
    fn test_invalid_config() {
        let config = VDiskConfig {
            min_huge_blob_size: 1 << 30,
            ..VDiskConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = VDiskConfig {
            backlog: BacklogConfig {
                blocks: 0,
                ..BacklogConfig::default()
            },
            ..VDiskConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
