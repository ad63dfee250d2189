use std::path::PathBuf;

use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

/// Engine configuration. All options have defaults; `validate` is called
/// by storage init and rejects degenerate values with invalid-argument.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for block files.
    pub data_dir: PathBuf,
    /// Byte budget per sealed block.
    pub block_size: u64,
    /// Record-count budget per sealed block.
    pub max_block_records: usize,
    /// Retention cap on sealed blocks per series.
    pub max_blocks_per_series: usize,
    /// In-memory budget for sealed blocks kept resident after flush.
    pub cache_size_bytes: u64,
    /// Time span covered by one block bucket.
    pub block_duration_ms: i64,
    /// Blocks wholly older than this are deleted on compact.
    pub retention_period_ms: i64,
    /// Compress sample streams on flush.
    pub enable_compression: bool,
    /// Upper bound on in-flight compaction tasks.
    pub max_concurrent_compactions: usize,
    /// Per-query wall-clock budget.
    pub query_timeout_ms: u64,
    /// Soft cap on samples materialized per query.
    pub max_samples_per_query: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            block_size: 64 * 1024 * 1024,
            max_block_records: 1_000_000,
            max_blocks_per_series: 1024,
            cache_size_bytes: 1024 * 1024 * 1024,
            block_duration_ms: 2 * 60 * 60 * 1000,
            retention_period_ms: 7 * 24 * 60 * 60 * 1000,
            enable_compression: true,
            max_concurrent_compactions: 2,
            query_timeout_ms: 30_000,
            max_samples_per_query: 1_000_000,
        }
    }
}

impl StorageConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "EmptyDataDir",
                "data_dir must not be empty",
            ));
        }
        if self.block_size == 0 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "ZeroBlockSize",
                "block_size must be positive",
            ));
        }
        if self.max_block_records == 0 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "ZeroBlockRecords",
                "max_block_records must be positive",
            ));
        }
        if self.block_duration_ms <= 0 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "NonPositiveBlockDuration",
                format!("block_duration_ms must be positive, got {}", self.block_duration_ms),
            ));
        }
        if self.retention_period_ms < 0 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "NegativeRetention",
                format!(
                    "retention_period_ms must be non-negative, got {}",
                    self.retention_period_ms
                ),
            ));
        }
        if self.max_concurrent_compactions == 0 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "ZeroCompactions",
                "max_concurrent_compactions must be positive",
            ));
        }
        Ok(())
    }
}
