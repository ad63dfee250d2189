use std::sync::{
    atomic::Ordering,
    Arc,
};

use arc_swap::ArcSwap;
use common::{
    Fingerprint,
    Labels,
    Sample,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;

use crate::{
    block::{
        BlockId,
        HeadBlock,
        SealedBlock,
        SealedList,
    },
    engine::Shared,
};

struct AppendState {
    // Tail timestamp across every block of the series, enforcing strict
    // monotonicity over seals.
    last_ts: Option<i64>,
    head: Option<HeadBlock>,
}

/// Owns one series: canonical labels, the writable head block, and the
/// sealed-block list. Appends take the per-series `append` lock, so writes
/// to different series never contend; the sealed list is swapped
/// atomically so readers see a consistent snapshot without locking.
pub(crate) struct SeriesHandle {
    pub fingerprint: Fingerprint,
    pub labels: Labels,
    append: Mutex<AppendState>,
    sealed: SealedList,
    // Advisory: held by compaction and retention so they never race each
    // other on the same series.
    pub(crate) maintenance_lock: Mutex<()>,
}

impl SeriesHandle {
    pub fn new(labels: Labels) -> Self {
        Self {
            fingerprint: labels.fingerprint(),
            labels,
            append: Mutex::new(AppendState {
                last_ts: None,
                head: None,
            }),
            sealed: ArcSwap::from_pointee(Vec::new()),
            maintenance_lock: Mutex::new(()),
        }
    }

    pub fn recovered(labels: Labels, blocks: Vec<Arc<SealedBlock>>) -> Self {
        let last_ts = blocks.last().map(|b| b.max_ts);
        Self {
            fingerprint: labels.fingerprint(),
            labels,
            append: Mutex::new(AppendState {
                last_ts,
                head: None,
            }),
            sealed: ArcSwap::from_pointee(blocks),
            maintenance_lock: Mutex::new(()),
        }
    }

    pub fn sealed_snapshot(&self) -> Arc<Vec<Arc<SealedBlock>>> {
        self.sealed.load_full()
    }

    /// Replace the sealed list. Only called from `seal_locked`, under the
    /// append lock.
    fn swap_sealed(&self, blocks: Vec<Arc<SealedBlock>>) {
        self.sealed.store(Arc::new(blocks));
    }

    /// Publish a maintenance result: `replacement` stands in for the first
    /// `observed_len` blocks of the list. Taking the append lock excludes
    /// concurrent seals, and any blocks sealed since the caller's snapshot
    /// are grafted back onto the tail.
    pub(crate) fn replace_sealed_prefix(
        &self,
        observed_len: usize,
        mut replacement: Vec<Arc<SealedBlock>>,
    ) {
        let _state = self.append.lock();
        let current = self.sealed.load_full();
        replacement.extend(current.iter().skip(observed_len).cloned());
        self.sealed.store(Arc::new(replacement));
    }

    fn seal_locked(&self, state: &mut AppendState, shared: &Shared) {
        let Some(head) = state.head.take() else {
            return;
        };
        if head.samples.is_empty() {
            return;
        }
        let id = BlockId(shared.next_block_id.fetch_add(1, Ordering::SeqCst));
        let block = Arc::new(SealedBlock::new(
            id,
            self.fingerprint,
            self.labels.clone(),
            head.t_start,
            head.t_end,
            head.samples,
        ));
        let mut list = Vec::clone(&self.sealed.load());
        list.push(block.clone());
        self.swap_sealed(list);
        shared.note_sealed(block);
    }

    /// Append a batch of samples, sealing the head whenever a limit is
    /// crossed. The whole batch is validated first so a rejected batch
    /// changes nothing, and the append lock is held throughout so readers
    /// observe either none or all of it.
    pub fn append_batch(&self, samples: &[Sample], shared: &Shared) -> anyhow::Result<()> {
        let mut state = self.append.lock();

        let mut expected_after = state.last_ts;
        for sample in samples {
            if let Some(last) = expected_after {
                if sample.timestamp_ms <= last {
                    anyhow::bail!(ErrorMetadata::invalid_argument(
                        "NonMonotonicTimestamp",
                        format!(
                            "sample timestamp {} for series {} is not newer than {last}",
                            sample.timestamp_ms, self.labels
                        ),
                    ));
                }
            }
            expected_after = Some(sample.timestamp_ms);
        }

        for sample in samples {
            let in_head = state
                .head
                .as_ref()
                .is_some_and(|head| head.contains(sample.timestamp_ms));
            if !in_head {
                self.seal_locked(&mut state, shared);
                state.head = Some(HeadBlock::new(
                    sample.timestamp_ms,
                    shared.config.block_duration_ms,
                ));
            }
            let head = state.head.as_mut().expect("head allocated above");
            head.samples.push(*sample);

            let over_records = head.samples.len() >= shared.config.max_block_records;
            let over_size = head.size_estimate() as u64 >= shared.config.block_size;
            state.last_ts = Some(sample.timestamp_ms);
            if over_records || over_size {
                self.seal_locked(&mut state, shared);
            }
        }
        Ok(())
    }

    /// Seal the current head if it holds samples. Used by flush, close,
    /// and the periodic pass that seals heads whose window has elapsed.
    pub fn seal_head(&self, shared: &Shared) {
        let mut state = self.append.lock();
        self.seal_locked(&mut state, shared);
    }

    /// Seal the head only when its time window already ended.
    pub fn seal_head_if_elapsed(&self, now_ms: i64, shared: &Shared) {
        let mut state = self.append.lock();
        let elapsed = state.head.as_ref().is_some_and(|head| head.t_end <= now_ms);
        if elapsed {
            self.seal_locked(&mut state, shared);
        }
    }

    /// Materialize all samples in `[t0, t1)` across sealed blocks and the
    /// head, in ascending timestamp order. Evicted blocks are reloaded
    /// from disk and re-cached.
    pub fn read_range(&self, t0: i64, t1: i64, shared: &Shared) -> anyhow::Result<Vec<Sample>> {
        let mut out = Vec::new();
        // Sealed blocks are list-ordered by time: every append goes through
        // the monotonic tail check.
        for block in self.sealed_snapshot().iter() {
            if !block.overlaps(t0, t1) {
                continue;
            }
            let samples = match block.resident_samples() {
                Some(samples) => samples,
                None => shared.load_block_samples(block)?,
            };
            for sample in samples.iter() {
                if sample.timestamp_ms >= t1 {
                    break;
                }
                if sample.timestamp_ms >= t0 {
                    out.push(*sample);
                }
            }
        }
        let state = self.append.lock();
        if let Some(head) = &state.head {
            for sample in &head.samples {
                if sample.timestamp_ms >= t1 {
                    break;
                }
                if sample.timestamp_ms >= t0 {
                    out.push(*sample);
                }
            }
        }
        Ok(out)
    }

    /// Total samples currently held (head plus sealed).
    pub fn sample_count(&self) -> usize {
        let sealed: usize = self
            .sealed_snapshot()
            .iter()
            .map(|b| b.record_count)
            .sum();
        sealed + self.append.lock().head.as_ref().map_or(0, |h| h.samples.len())
    }

    pub fn block_ids(&self) -> Vec<BlockId> {
        self.sealed_snapshot().iter().map(|b| b.id).collect()
    }
}
