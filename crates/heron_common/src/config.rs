use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine-wide configuration. Every field has a default so a config file
/// only needs to name what it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root data directory; one subdirectory per table.
    pub root: PathBuf,

    /// Idle pooled resources older than this are evicted by the
    /// maintenance job.
    #[serde(default = "default_idle_ttl_ms")]
    pub idle_ttl_ms: u64,

    /// Interval between maintenance runs.
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Capacity of the bounded commit-notification queue. When full,
    /// notifications are dropped and the apply job falls back to scanning.
    #[serde(default = "default_commit_queue_capacity")]
    pub commit_queue_capacity: usize,

    /// Rows per WAL segment before the segment writer rolls over.
    #[serde(default = "default_segment_rollover_rows")]
    pub segment_rollover_rows: u64,

    /// Upper bound on table (and thus directory) name length.
    #[serde(default = "default_max_name_len")]
    pub max_name_len: usize,

    /// Fsync durable files on every append. Tests turn this off.
    #[serde(default = "default_sync_on_commit")]
    pub sync_on_commit: bool,
}

fn default_idle_ttl_ms() -> u64 {
    600_000
}

fn default_maintenance_interval_ms() -> u64 {
    30_000
}

fn default_commit_queue_capacity() -> usize {
    256
}

fn default_segment_rollover_rows() -> u64 {
    200_000
}

fn default_max_name_len() -> usize {
    127
}

fn default_sync_on_commit() -> bool {
    true
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            idle_ttl_ms: default_idle_ttl_ms(),
            maintenance_interval_ms: default_maintenance_interval_ms(),
            commit_queue_capacity: default_commit_queue_capacity(),
            segment_rollover_rows: default_segment_rollover_rows(),
            max_name_len: default_max_name_len(),
            sync_on_commit: default_sync_on_commit(),
        }
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
