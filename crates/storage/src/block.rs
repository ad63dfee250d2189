use std::sync::atomic::{
    AtomicBool,
    Ordering,
};

use arc_swap::ArcSwap;
use common::{
    Fingerprint,
    Labels,
    Sample,
};
use parking_lot::RwLock;
use serde::{
    Deserialize,
    Serialize,
};

/// Monotonically assigned identifier for a sealed block. Doubles as the
/// block's directory name under `data_dir`.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:020}", self.0)
    }
}

pub(crate) const SAMPLE_ENCODED_SIZE: usize = 16;

/// Align a timestamp down to the start of its block bucket.
pub(crate) fn bucket_start(timestamp_ms: i64, block_duration_ms: i64) -> i64 {
    timestamp_ms.div_euclid(block_duration_ms) * block_duration_ms
}

/// The currently-writable block of one series. Owned by the series handle
/// and only touched under its append lock.
#[derive(Debug)]
pub(crate) struct HeadBlock {
    pub t_start: i64,
    pub t_end: i64,
    pub samples: Vec<Sample>,
}

impl HeadBlock {
    pub fn new(timestamp_ms: i64, block_duration_ms: i64) -> Self {
        let t_start = bucket_start(timestamp_ms, block_duration_ms);
        Self {
            t_start,
            t_end: t_start + block_duration_ms,
            samples: Vec::new(),
        }
    }

    pub fn contains(&self, timestamp_ms: i64) -> bool {
        (self.t_start..self.t_end).contains(&timestamp_ms)
    }

    /// Serialized size estimate, one of the three seal triggers.
    pub fn size_estimate(&self) -> usize {
        self.samples.len() * SAMPLE_ENCODED_SIZE
    }
}

/// A sealed, immutable container of one series' samples over
/// `[t_start, t_end)`. Samples may be evicted from memory once the block
/// is flushed; they are reloaded from disk on demand.
pub struct SealedBlock {
    pub id: BlockId,
    pub fingerprint: Fingerprint,
    pub labels: Labels,
    pub t_start: i64,
    pub t_end: i64,
    pub record_count: usize,
    pub min_ts: i64,
    pub max_ts: i64,
    flushed: AtomicBool,
    samples: RwLock<Option<std::sync::Arc<Vec<Sample>>>>,
}

impl SealedBlock {
    pub(crate) fn new(
        id: BlockId,
        fingerprint: Fingerprint,
        labels: Labels,
        t_start: i64,
        t_end: i64,
        samples: Vec<Sample>,
    ) -> Self {
        debug_assert!(!samples.is_empty(), "sealing an empty head block");
        let min_ts = samples.first().map_or(t_start, |s| s.timestamp_ms);
        let max_ts = samples.last().map_or(t_start, |s| s.timestamp_ms);
        Self {
            id,
            fingerprint,
            labels,
            t_start,
            t_end,
            record_count: samples.len(),
            min_ts,
            max_ts,
            flushed: AtomicBool::new(false),
            samples: RwLock::new(Some(std::sync::Arc::new(samples))),
        }
    }

    /// Rebuild the in-memory representation of a block recovered from
    /// disk. Samples stay evicted until a read wants them.
    pub(crate) fn recovered(
        id: BlockId,
        fingerprint: Fingerprint,
        labels: Labels,
        t_start: i64,
        t_end: i64,
        record_count: usize,
        min_ts: i64,
        max_ts: i64,
    ) -> Self {
        Self {
            id,
            fingerprint,
            labels,
            t_start,
            t_end,
            record_count,
            min_ts,
            max_ts,
            flushed: AtomicBool::new(true),
            samples: RwLock::new(None),
        }
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::Release);
    }

    /// Resident samples, if any. Callers fall back to a disk read when the
    /// block has been evicted.
    pub(crate) fn resident_samples(&self) -> Option<std::sync::Arc<Vec<Sample>>> {
        self.samples.read().clone()
    }

    pub(crate) fn cache_samples(&self, samples: std::sync::Arc<Vec<Sample>>) {
        *self.samples.write() = Some(samples);
    }

    /// Drop the in-memory sample copy. Only legal once the block has been
    /// flushed; otherwise the data would exist nowhere.
    pub(crate) fn evict(&self) -> bool {
        if !self.is_flushed() {
            return false;
        }
        self.samples.write().take().is_some()
    }

    pub fn size_bytes(&self) -> usize {
        self.record_count * SAMPLE_ENCODED_SIZE
    }

    pub fn overlaps(&self, t0: i64, t1: i64) -> bool {
        self.min_ts < t1 && t0 <= self.max_ts
    }
}

/// The per-series sealed list, swapped atomically on seal and compaction
/// so queries observe either the old or the new set, never a mix.
pub(crate) type SealedList = ArcSwap<Vec<std::sync::Arc<SealedBlock>>>;
