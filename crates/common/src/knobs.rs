//! Tunable limits that are not part of the public configuration surface.
//! Every knob can be overridden with an environment variable of the same
//! name when running locally.

use std::{
    str::FromStr,
    sync::LazyLock,
    thread,
};

fn env_config<T: FromStr>(name: &str, default: T) -> T {
    let Ok(var) = std::env::var(name) else {
        return default;
    };
    match var.parse() {
        Ok(v) => {
            tracing::info!("Overriding {name} to {var} from environment");
            v
        },
        Err(_) => {
            tracing::warn!("Invalid value {var:?} for {name}, falling back to default");
            default
        },
    }
}

/// Number of write shards. 0 -> default (number of cores).
pub static WRITE_SHARDS: LazyLock<usize> = LazyLock::new(|| env_config("WRITE_SHARDS", 0));

/// Capacity of each write shard's queue, in batches. A full queue fails
/// writes with resource-exhausted.
pub static WRITE_SHARD_QUEUE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("WRITE_SHARD_QUEUE_SIZE", 10_000));

/// Unflushed sealed blocks above this mark fail writes fast until the
/// flusher catches up.
pub static SEALED_BLOCK_HIGH_WATER_MARK: LazyLock<usize> =
    LazyLock::new(|| env_config("SEALED_BLOCK_HIGH_WATER_MARK", 512));

/// Initial backoff for retrying a failed block flush.
pub static FLUSH_RETRY_INITIAL_BACKOFF_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("FLUSH_RETRY_INITIAL_BACKOFF_MS", 50));

/// Backoff ceiling for retrying a failed block flush.
pub static FLUSH_RETRY_MAX_BACKOFF_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("FLUSH_RETRY_MAX_BACKOFF_MS", 5_000));

/// Scan interval of the derived-metric scheduler.
pub static DERIVED_METRICS_TICK_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("DERIVED_METRICS_TICK_MS", 1_000));

/// Interval between background maintenance passes (stale-head sealing,
/// retention, compaction, cache budget enforcement).
pub static MAINTENANCE_INTERVAL_MS: LazyLock<u64> =
    LazyLock::new(|| env_config("MAINTENANCE_INTERVAL_MS", 60_000));

/// Resolved shard count: the knob if set, otherwise available parallelism.
pub fn write_shard_count() -> usize {
    let configured = *WRITE_SHARDS;
    if configured > 0 {
        return configured;
    }
    thread::available_parallelism().map_or(4, |n| n.get())
}
