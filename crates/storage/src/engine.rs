use std::{
    collections::{
        BTreeSet,
        HashMap,
    },
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Weak,
    },
    time::{
        Duration,
        Instant,
        SystemTime,
    },
};

use anyhow::Context;
use common::{
    knobs,
    Fingerprint,
    LabelMatcher,
    Labels,
    Sample,
    StorageConfig,
    TimeSeries,
    METRIC_NAME_LABEL,
};
use errors::ErrorMetadata;
use futures::StreamExt;
use metrics::StorageMetrics;
use parking_lot::{
    Mutex,
    RwLock,
};
use tokio::sync::{
    mpsc,
    oneshot,
    watch,
};

use crate::{
    block::{
        BlockId,
        SealedBlock,
    },
    disk::DiskLayout,
    series::SeriesHandle,
};

/// State shared between the store facade, the shard workers, and the
/// background flusher and maintenance tasks.
pub(crate) struct Shared {
    pub config: StorageConfig,
    pub layout: DiskLayout,
    pub next_block_id: AtomicU64,
    pub metrics: Arc<StorageMetrics>,
    flush_tx: mpsc::UnboundedSender<Arc<SealedBlock>>,
    unflushed_tx: watch::Sender<usize>,
    resident_bytes: AtomicUsize,
    // Fingerprints deleted while their blocks may still sit in the flush
    // queue; the flusher drops these instead of resurrecting them on disk.
    tombstones: RwLock<BTreeSet<Fingerprint>>,
}

impl Shared {
    pub fn note_sealed(&self, block: Arc<SealedBlock>) {
        self.metrics.blocks_sealed.inc();
        self.metrics.unflushed_sealed_blocks.inc();
        self.unflushed_tx.send_modify(|count| *count += 1);
        self.resident_bytes
            .fetch_add(block.size_bytes(), Ordering::Relaxed);
        // The receiver lives until close() has drained every pending flush.
        let _ = self.flush_tx.send(block);
    }

    fn note_flushed(&self) {
        self.metrics.blocks_flushed.inc();
        self.metrics.unflushed_sealed_blocks.dec();
        self.unflushed_tx.send_modify(|count| *count -= 1);
    }

    fn unflushed_count(&self) -> usize {
        *self.unflushed_tx.borrow()
    }

    pub fn load_block_samples(&self, block: &SealedBlock) -> anyhow::Result<Arc<Vec<Sample>>> {
        let samples = Arc::new(self.layout.read_samples(block.id)?);
        block.cache_samples(samples.clone());
        self.resident_bytes
            .fetch_add(block.size_bytes(), Ordering::Relaxed);
        Ok(samples)
    }

    fn evict_block(&self, block: &SealedBlock) {
        if block.evict() {
            self.resident_bytes
                .fetch_sub(block.size_bytes(), Ordering::Relaxed);
        }
    }

    fn over_cache_budget(&self) -> bool {
        self.resident_bytes.load(Ordering::Relaxed) as u64 > self.config.cache_size_bytes
    }

    fn is_tombstoned(&self, fingerprint: Fingerprint) -> bool {
        self.tombstones.read().contains(&fingerprint)
    }
}

#[derive(Default)]
struct SeriesRegistry {
    // One entry per fingerprint; the inner list resolves hash collisions
    // by full label comparison and virtually always has length one.
    by_fingerprint: HashMap<Fingerprint, Vec<Arc<SeriesHandle>>>,
    by_name: HashMap<String, BTreeSet<Fingerprint>>,
}

impl SeriesRegistry {
    fn find(&self, fingerprint: Fingerprint, labels: &Labels) -> Option<Arc<SeriesHandle>> {
        self.by_fingerprint
            .get(&fingerprint)?
            .iter()
            .find(|handle| &handle.labels == labels)
            .cloned()
    }

    fn insert(&mut self, handle: Arc<SeriesHandle>) {
        if let Some(name) = handle.labels.name() {
            self.by_name
                .entry(name.to_string())
                .or_default()
                .insert(handle.fingerprint);
        }
        self.by_fingerprint
            .entry(handle.fingerprint)
            .or_default()
            .push(handle);
    }

    fn remove(&mut self, handle: &Arc<SeriesHandle>) {
        let mut fingerprint_gone = false;
        if let Some(handles) = self.by_fingerprint.get_mut(&handle.fingerprint) {
            handles.retain(|h| !Arc::ptr_eq(h, handle));
            if handles.is_empty() {
                self.by_fingerprint.remove(&handle.fingerprint);
                fingerprint_gone = true;
            }
        }
        if fingerprint_gone {
            if let Some(name) = handle.labels.name() {
                if let Some(fingerprints) = self.by_name.get_mut(name) {
                    fingerprints.remove(&handle.fingerprint);
                    if fingerprints.is_empty() {
                        self.by_name.remove(name);
                    }
                }
            }
        }
    }

    fn all_handles(&self) -> Vec<Arc<SeriesHandle>> {
        self.by_fingerprint.values().flatten().cloned().collect()
    }
}

struct ShardRequest {
    series: TimeSeries,
    result: oneshot::Sender<anyhow::Result<()>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

fn validate_range(t0: i64, t1: i64) -> anyhow::Result<()> {
    if t1 < t0 {
        anyhow::bail!(ErrorMetadata::invalid_argument(
            "InvertedRange",
            format!("range end {t1} precedes range start {t0}"),
        ));
    }
    Ok(())
}

/// The storage core: series registry, fingerprint-sharded write routing,
/// block lifecycle, and the label/matcher query engine.
pub struct TimeSeriesStore {
    shared: Arc<Shared>,
    registry: Arc<RwLock<SeriesRegistry>>,
    // Cleared by close(); dropping the senders lets each worker drain its
    // queue and exit.
    shards: RwLock<Vec<mpsc::Sender<ShardRequest>>>,
    worker_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    background_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
}

impl TimeSeriesStore {
    /// Create or open the store at `config.data_dir`, recovering all
    /// well-formed blocks, and start the shard workers and background
    /// tasks.
    pub fn new(config: StorageConfig, metrics: Arc<StorageMetrics>) -> anyhow::Result<Arc<Self>> {
        config.validate()?;
        let layout = DiskLayout::new(&config.data_dir, config.enable_compression);
        let recovered = layout.recover().context(ErrorMetadata::internal(
            "RecoveryFailed",
            "failed to scan data_dir during recovery",
        ))?;

        let mut next_block_id = 0u64;
        let mut by_series: HashMap<(Fingerprint, Labels), Vec<Arc<SealedBlock>>> = HashMap::new();
        for meta in recovered {
            next_block_id = next_block_id.max(meta.block_id.0 + 1);
            let block = Arc::new(SealedBlock::recovered(
                meta.block_id,
                meta.fingerprint,
                meta.labels.clone(),
                meta.t_start,
                meta.t_end,
                meta.record_count,
                meta.min_ts,
                meta.max_ts,
            ));
            by_series
                .entry((meta.fingerprint, meta.labels))
                .or_default()
                .push(block);
        }

        let mut registry = SeriesRegistry::default();
        for ((_, labels), mut blocks) in by_series {
            blocks.sort_by_key(|b| b.min_ts);
            registry.insert(Arc::new(SeriesHandle::recovered(labels, blocks)));
        }

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (unflushed_tx, _) = watch::channel(0usize);
        let shared = Arc::new(Shared {
            config,
            layout,
            next_block_id: AtomicU64::new(next_block_id),
            metrics,
            flush_tx,
            unflushed_tx,
            resident_bytes: AtomicUsize::new(0),
            tombstones: RwLock::new(BTreeSet::new()),
        });
        let registry = Arc::new(RwLock::new(registry));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut worker_tasks = Vec::new();
        let shard_count = knobs::write_shard_count();
        let mut shards = Vec::with_capacity(shard_count);
        for shard_id in 0..shard_count {
            let (tx, rx) = mpsc::channel(*knobs::WRITE_SHARD_QUEUE_SIZE);
            shards.push(tx);
            worker_tasks.push(tokio::spawn(shard_worker(
                shard_id,
                rx,
                registry.clone(),
                shared.clone(),
            )));
        }
        let background_tasks = vec![tokio::spawn(flusher(
            flush_rx,
            shared.clone(),
            shutdown_rx.clone(),
        ))];

        let store = Arc::new(Self {
            shared,
            registry,
            shards: RwLock::new(shards),
            worker_tasks: Mutex::new(worker_tasks),
            background_tasks: Mutex::new(background_tasks),
            shutdown_tx,
            closed: AtomicBool::new(false),
        });
        store.background_tasks.lock().push(tokio::spawn(maintenance_loop(
            Arc::downgrade(&store),
            shutdown_rx,
        )));
        Ok(store)
    }

    pub fn metrics(&self) -> &Arc<StorageMetrics> {
        &self.shared.metrics
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Route a series to its fingerprint shard and wait for the shard
    /// worker to apply it. FIFO order is preserved per fingerprint; a full
    /// shard queue or lagging flusher rejects the write instead of
    /// blocking it.
    pub async fn write(&self, series: TimeSeries) -> anyhow::Result<()> {
        if series.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            anyhow::bail!(ErrorMetadata::unavailable(
                "StoreClosed",
                "storage is shutting down",
            ));
        }
        if series.labels().is_empty() {
            self.shared.metrics.write_errors.inc();
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "EmptyLabels",
                "cannot write a series with no labels",
            ));
        }
        if let Some(sample) = series.samples().iter().find(|s| s.timestamp_ms < 0) {
            self.shared.metrics.write_errors.inc();
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "NegativeTimestamp",
                format!("negative timestamp {}", sample.timestamp_ms),
            ));
        }
        if self.shared.unflushed_count() > *knobs::SEALED_BLOCK_HIGH_WATER_MARK {
            self.shared.metrics.write_errors.inc();
            anyhow::bail!(ErrorMetadata::resource_exhausted(
                "FlushLagging",
                "sealed blocks are accumulating faster than the flusher drains them",
            ));
        }

        let fingerprint = series.labels().fingerprint();
        let (result_tx, result_rx) = oneshot::channel();
        let request = ShardRequest {
            series,
            result: result_tx,
        };
        let send_result = {
            let shards = self.shards.read();
            if shards.is_empty() {
                anyhow::bail!(ErrorMetadata::unavailable(
                    "StoreClosed",
                    "storage is shutting down",
                ));
            }
            let shard = &shards[(fingerprint.0 % shards.len() as u64) as usize];
            shard.try_send(request)
        };
        if let Err(e) = send_result {
            self.shared.metrics.write_errors.inc();
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    anyhow::bail!(ErrorMetadata::resource_exhausted(
                        "ShardQueueFull",
                        "write shard queue is at capacity",
                    ))
                },
                mpsc::error::TrySendError::Closed(_) => {
                    anyhow::bail!(ErrorMetadata::unavailable(
                        "StoreClosed",
                        "storage is shutting down",
                    ))
                },
            }
        }
        match result_rx.await {
            Ok(result) => {
                if result.is_err() {
                    self.shared.metrics.write_errors.inc();
                }
                result
            },
            Err(_) => anyhow::bail!(ErrorMetadata::unavailable(
                "StoreClosed",
                "storage shut down before the write was applied",
            )),
        }
    }

    /// Materialize the full series with exactly `labels` over `[t0, t1)`.
    pub fn read(&self, labels: &Labels, t0: i64, t1: i64) -> anyhow::Result<TimeSeries> {
        validate_range(t0, t1)?;
        let handle = self
            .registry
            .read()
            .find(labels.fingerprint(), labels)
            .ok_or_else(|| {
                ErrorMetadata::not_found("UnknownSeries", format!("no series with labels {labels}"))
            })?;
        let samples = if t0 == t1 {
            Vec::new()
        } else {
            handle.read_range(t0, t1, &self.shared)?
        };
        TimeSeries::from_parts(labels.clone(), samples)
    }

    /// Resolve all series satisfying every matcher (AND) and materialize
    /// them over `[t0, t1)`. An exact `__name__` matcher narrows through
    /// the inverted name index before the linear matcher scan.
    pub fn query(
        &self,
        matchers: &[LabelMatcher],
        t0: i64,
        t1: i64,
    ) -> anyhow::Result<Vec<TimeSeries>> {
        validate_range(t0, t1)?;
        self.shared.metrics.queries_executed.inc();
        if t0 == t1 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + Duration::from_millis(self.shared.config.query_timeout_ms);

        let candidates = {
            let registry = self.registry.read();
            let name_matcher = matchers
                .iter()
                .find(|m| m.name() == METRIC_NAME_LABEL && m.is_exact());
            match name_matcher {
                Some(matcher) => match registry.by_name.get(matcher.value()) {
                    Some(fingerprints) => fingerprints
                        .iter()
                        .filter_map(|fp| registry.by_fingerprint.get(fp))
                        .flatten()
                        .cloned()
                        .collect(),
                    None => Vec::new(),
                },
                None => registry.all_handles(),
            }
        };

        let mut results = Vec::new();
        let mut total_samples = 0usize;
        for handle in candidates {
            if Instant::now() >= deadline {
                anyhow::bail!(ErrorMetadata::deadline_exceeded(
                    "QueryTimeout",
                    format!(
                        "query exceeded its {}ms budget",
                        self.shared.config.query_timeout_ms
                    ),
                ));
            }
            if !matchers.iter().all(|m| m.matches(&handle.labels)) {
                continue;
            }
            let mut samples = handle.read_range(t0, t1, &self.shared)?;
            if samples.is_empty() {
                continue;
            }
            // Soft cap: truncate the series that crosses the budget and
            // stop emitting further series.
            let budget = self.shared.config.max_samples_per_query;
            let capped = total_samples + samples.len() >= budget;
            if capped {
                samples.truncate(budget - total_samples);
            }
            total_samples += samples.len();
            if !samples.is_empty() {
                results.push(TimeSeries::from_parts(handle.labels.clone(), samples)?);
            }
            if capped {
                break;
            }
        }
        results.sort_by_key(|series| series.labels().canonical_string());
        Ok(results)
    }

    /// Union of label keys across all series, sorted.
    pub fn label_names(&self) -> Vec<String> {
        let registry = self.registry.read();
        let mut names = BTreeSet::new();
        for handle in registry.by_fingerprint.values().flatten() {
            for (name, _) in handle.labels.iter_ordered() {
                names.insert(name.to_string());
            }
        }
        names.into_iter().collect()
    }

    /// Union of observed values for one label key, sorted. An unknown key
    /// yields an empty list, not an error.
    pub fn label_values(&self, label_name: &str) -> Vec<String> {
        let registry = self.registry.read();
        let mut values = BTreeSet::new();
        for handle in registry.by_fingerprint.values().flatten() {
            if let Some(value) = handle.labels.get(label_name) {
                values.insert(value.to_string());
            }
        }
        values.into_iter().collect()
    }

    /// Remove every series matching all matchers, deleting its blocks and
    /// tombstoning its fingerprint so in-flight flushes cannot resurrect
    /// it. Returns the number of series removed.
    pub fn delete_series(&self, matchers: &[LabelMatcher]) -> anyhow::Result<usize> {
        if matchers.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "EmptyMatchers",
                "delete_series requires at least one matcher",
            ));
        }
        let victims: Vec<Arc<SeriesHandle>> = {
            let mut registry = self.registry.write();
            let victims: Vec<_> = registry
                .all_handles()
                .into_iter()
                .filter(|handle| matchers.iter().all(|m| m.matches(&handle.labels)))
                .collect();
            for handle in &victims {
                registry.remove(handle);
            }
            victims
        };
        {
            let mut tombstones = self.shared.tombstones.write();
            for handle in &victims {
                tombstones.insert(handle.fingerprint);
            }
        }
        for handle in &victims {
            for block_id in handle.block_ids() {
                if let Err(e) = self.shared.layout.remove_block(block_id) {
                    tracing::warn!("failed to remove block {block_id}: {e:#}");
                }
            }
            self.shared.metrics.series_deleted.inc();
        }
        Ok(victims.len())
    }

    /// Seal every non-empty head and wait for the flusher to drain.
    pub async fn flush(&self) -> anyhow::Result<()> {
        let handles = self.registry.read().all_handles();
        for handle in handles {
            handle.seal_head(&self.shared);
        }
        let mut unflushed_rx = self.shared.unflushed_tx.subscribe();
        loop {
            if *unflushed_rx.borrow_and_update() == 0 {
                return Ok(());
            }
            if unflushed_rx.changed().await.is_err() {
                // Flusher gone: shutdown already drained everything.
                return Ok(());
            }
        }
    }

    /// Run one maintenance pass now: seal elapsed heads, apply retention,
    /// compact adjacent blocks, and enforce the cache budget.
    pub async fn compact(&self) -> anyhow::Result<()> {
        let handles = self.registry.read().all_handles();
        let now = now_ms();
        let shared = &self.shared;
        futures::stream::iter(handles)
            .for_each_concurrent(shared.config.max_concurrent_compactions, |handle| async move {
                maintain_series(&handle, now, shared);
            })
            .await;
        Ok(())
    }

    /// Stop background work, drain in-flight writes, and flush pending
    /// heads. The store rejects new writes once closing begins.
    pub async fn close(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Dropping the senders closes each shard queue; workers finish
        // what is already enqueued and exit.
        self.shards.write().clear();
        let worker_tasks = std::mem::take(&mut *self.worker_tasks.lock());
        for task in worker_tasks {
            let _ = task.await;
        }
        // Everything buffered is now in heads or the flush queue.
        let handles = self.registry.read().all_handles();
        for handle in handles {
            handle.seal_head(&self.shared);
        }
        self.flush().await?;
        self.shutdown_tx.send_replace(true);
        let background_tasks = std::mem::take(&mut *self.background_tasks.lock());
        for task in background_tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// One-line operational summary.
    pub fn stats(&self) -> String {
        let registry = self.registry.read();
        let series: usize = registry.by_fingerprint.values().map(|v| v.len()).sum();
        let sealed: usize = registry
            .by_fingerprint
            .values()
            .flatten()
            .map(|h| h.sealed_snapshot().len())
            .sum();
        format!(
            "series={series} sealed_blocks={sealed} unflushed={} resident_bytes={}",
            self.shared.unflushed_count(),
            self.shared.resident_bytes.load(Ordering::Relaxed),
        )
    }
}

async fn shard_worker(
    shard_id: usize,
    mut rx: mpsc::Receiver<ShardRequest>,
    registry: Arc<RwLock<SeriesRegistry>>,
    shared: Arc<Shared>,
) {
    tracing::debug!("write shard {shard_id} started");
    while let Some(request) = rx.recv().await {
        let result = apply_write(request.series, &registry, &shared);
        // The writer may have given up waiting; that does not affect the
        // applied state.
        let _ = request.result.send(result);
    }
    tracing::debug!("write shard {shard_id} stopped");
}

fn apply_write(
    series: TimeSeries,
    registry: &RwLock<SeriesRegistry>,
    shared: &Shared,
) -> anyhow::Result<()> {
    let fingerprint = series.labels().fingerprint();
    let handle = {
        let found = registry.read().find(fingerprint, series.labels());
        match found {
            Some(handle) => handle,
            None => {
                let mut registry = registry.write();
                // Double-checked: another batch for the same new series may
                // have won the race between our read and write locks.
                match registry.find(fingerprint, series.labels()) {
                    Some(handle) => handle,
                    None => {
                        let handle = Arc::new(SeriesHandle::new(series.labels().clone()));
                        registry.insert(handle.clone());
                        shared.metrics.series_created.inc();
                        shared.tombstones.write().remove(&fingerprint);
                        handle
                    },
                }
            },
        }
    };
    handle.append_batch(series.samples(), shared)?;
    shared
        .metrics
        .samples_ingested
        .inc_by(series.samples().len() as u64);
    Ok(())
}

async fn flusher(
    mut flush_rx: mpsc::UnboundedReceiver<Arc<SealedBlock>>,
    shared: Arc<Shared>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let block = tokio::select! {
            block = flush_rx.recv() => match block {
                Some(block) => block,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                // Shutdown fires only after flush() drained the queue, but
                // drain defensively in case a straggler was sealed late.
                while let Ok(block) = flush_rx.try_recv() {
                    flush_one(&block, &shared).await;
                }
                break;
            },
        };
        flush_one(&block, &shared).await;
    }
    tracing::debug!("flusher stopped");
}

async fn flush_one(block: &Arc<SealedBlock>, shared: &Shared) {
    if shared.is_tombstoned(block.fingerprint) {
        shared.note_flushed();
        return;
    }
    let Some(samples) = block.resident_samples() else {
        // Sealed blocks stay resident until flushed, so this indicates a
        // bookkeeping bug rather than an IO problem.
        tracing::error!("sealed block {} lost its samples before flush", block.id);
        shared.note_flushed();
        return;
    };
    let mut backoff = Duration::from_millis(*knobs::FLUSH_RETRY_INITIAL_BACKOFF_MS);
    let max_backoff = Duration::from_millis(*knobs::FLUSH_RETRY_MAX_BACKOFF_MS);
    loop {
        match shared.layout.write_block(block, &samples) {
            Ok(()) => {
                block.mark_flushed();
                // Evict before acknowledging so a flush() waiter observes
                // the cache budget already enforced.
                if shared.over_cache_budget() {
                    shared.evict_block(block);
                }
                shared.note_flushed();
                return;
            },
            Err(e) => {
                tracing::warn!(
                    "flush of block {} failed, retrying in {:?}: {e:#}",
                    block.id,
                    backoff
                );
                shared.metrics.flush_retries.inc();
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            },
        }
    }
}

async fn maintenance_loop(store: Weak<TimeSeriesStore>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = Duration::from_millis(*knobs::MAINTENANCE_INTERVAL_MS);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown_rx.changed() => break,
        }
        let Some(store) = store.upgrade() else {
            break;
        };
        if let Err(e) = store.compact().await {
            tracing::warn!("maintenance pass failed: {e:#}");
        }
    }
    tracing::debug!("maintenance loop stopped");
}

/// Seal an elapsed head, expire blocks past retention, and merge adjacent
/// small blocks for one series. Runs under the series' maintenance lock;
/// queries keep observing the pre-maintenance list until the single
/// atomic swap.
fn maintain_series(handle: &Arc<SeriesHandle>, now_ms: i64, shared: &Shared) {
    let _guard = handle.maintenance_lock.lock();
    handle.seal_head_if_elapsed(now_ms, shared);

    let blocks = handle.sealed_snapshot();
    let retention_cutoff = now_ms.saturating_sub(shared.config.retention_period_ms);
    let mut kept: Vec<Arc<SealedBlock>> = Vec::with_capacity(blocks.len());
    let mut expired = Vec::new();
    for block in blocks.iter() {
        // Only flushed blocks are expired or merged; an unflushed block is
        // still owned by the flusher.
        if block.is_flushed() && block.t_end <= retention_cutoff {
            expired.push(block.clone());
        } else {
            kept.push(block.clone());
        }
    }

    // Enforce the per-series block cap, oldest first.
    while kept.len() > shared.config.max_blocks_per_series {
        let block = kept.remove(0);
        if !block.is_flushed() {
            kept.insert(0, block);
            break;
        }
        expired.push(block);
    }

    let (merged, replaced) = compact_adjacent(&kept, shared);
    if !expired.is_empty() || !replaced.is_empty() {
        handle.replace_sealed_prefix(blocks.len(), merged.clone());
    }
    for block in &expired {
        shared.metrics.blocks_expired.inc();
        if let Err(e) = shared.layout.remove_block(block.id) {
            tracing::warn!("failed to remove expired block {}: {e:#}", block.id);
        }
        shared.evict_block(block);
    }
    for block in &replaced {
        if let Err(e) = shared.layout.remove_block(block.id) {
            tracing::warn!("failed to remove compacted block {}: {e:#}", block.id);
        }
        shared.evict_block(block);
    }
    if shared.over_cache_budget() {
        for block in merged.iter().filter(|b| b.is_flushed()) {
            shared.evict_block(block);
            if !shared.over_cache_budget() {
                break;
            }
        }
    }
}

/// Greedily merge adjacent flushed blocks whose combined size stays below
/// the block size budget. Returns the new list and the blocks it
/// replaced.
fn compact_adjacent(
    blocks: &[Arc<SealedBlock>],
    shared: &Shared,
) -> (Vec<Arc<SealedBlock>>, Vec<Arc<SealedBlock>>) {
    let mut out: Vec<Arc<SealedBlock>> = Vec::with_capacity(blocks.len());
    let mut replaced: Vec<Arc<SealedBlock>> = Vec::new();
    let mut run: Vec<Arc<SealedBlock>> = Vec::new();
    let mut run_size = 0u64;

    fn finish_run(
        run: &mut Vec<Arc<SealedBlock>>,
        out: &mut Vec<Arc<SealedBlock>>,
        replaced: &mut Vec<Arc<SealedBlock>>,
        shared: &Shared,
    ) {
        if run.len() < 2 {
            out.append(run);
            return;
        }
        match merge_run(run, shared) {
            Ok(merged) => {
                replaced.append(run);
                out.push(merged);
            },
            Err(e) => {
                tracing::warn!("compaction merge failed, keeping originals: {e:#}");
                out.append(run);
            },
        }
    }

    for block in blocks {
        let fits = run_size + block.size_bytes() as u64 <= shared.config.block_size;
        if block.is_flushed() && fits {
            run_size += block.size_bytes() as u64;
            run.push(block.clone());
            continue;
        }
        finish_run(&mut run, &mut out, &mut replaced, shared);
        run_size = 0;
        if block.is_flushed() && (block.size_bytes() as u64) < shared.config.block_size {
            run_size = block.size_bytes() as u64;
            run.push(block.clone());
        } else {
            out.push(block.clone());
        }
    }
    finish_run(&mut run, &mut out, &mut replaced, shared);
    (out, replaced)
}

fn merge_run(run: &[Arc<SealedBlock>], shared: &Shared) -> anyhow::Result<Arc<SealedBlock>> {
    let mut samples = Vec::with_capacity(run.iter().map(|b| b.record_count).sum());
    for block in run {
        let block_samples = match block.resident_samples() {
            Some(s) => s,
            None => shared.load_block_samples(block)?,
        };
        samples.extend(block_samples.iter().copied());
    }
    let first = run.first().expect("merge run is non-empty");
    let last = run.last().expect("merge run is non-empty");
    let id = BlockId(shared.next_block_id.fetch_add(1, Ordering::SeqCst));
    let merged = Arc::new(SealedBlock::new(
        id,
        first.fingerprint,
        first.labels.clone(),
        first.t_start,
        last.t_end,
        samples,
    ));
    // Persist the merged block before it becomes visible so the originals
    // can be deleted without a durability gap.
    let merged_samples = merged
        .resident_samples()
        .expect("freshly sealed block is resident");
    shared.layout.write_block(&merged, &merged_samples)?;
    merged.mark_flushed();
    shared.metrics.blocks_compacted.inc_by(run.len() as u64);
    Ok(merged)
}
