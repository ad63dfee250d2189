//! Derived metrics: periodically evaluate a query and re-ingest its
//! result under a new metric name.

use std::{
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use async_trait::async_trait;
use common::{
    knobs,
    LabelMatcher,
    MatcherType,
    TimeSeries,
    METRIC_NAME_LABEL,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    engine::TimeSeriesStore,
    filtering::FilteringStorage,
};

/// The expression-evaluation dependency of the scheduler. A full query
/// language lives outside the engine; anything that can turn a query
/// string and an evaluation time into series satisfies the scheduler.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn eval(&self, query: &str, at_ms: i64) -> anyhow::Result<Vec<TimeSeries>>;
}

/// A [`QueryEngine`] that evaluates plain selector expressions
/// (`name{label="v", label=~"re", ...}`) against storage over a trailing
/// lookback window.
pub struct SelectorQueryEngine {
    store: Arc<TimeSeriesStore>,
    lookback_ms: i64,
}

impl SelectorQueryEngine {
    pub fn new(store: Arc<TimeSeriesStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            lookback_ms: 5 * 60 * 1000,
        })
    }

    fn parse_selector(query: &str) -> anyhow::Result<Vec<LabelMatcher>> {
        let query = query.trim();
        let invalid = |detail: String| {
            anyhow::Error::from(ErrorMetadata::invalid_argument(
                "InvalidQueryExpression",
                format!("cannot parse selector {query:?}: {detail}"),
            ))
        };
        let mut matchers = Vec::new();
        let (name_part, body) = match query.find('{') {
            None => (query, None),
            Some(open) => {
                let (name_part, rest) = query.split_at(open);
                let body = rest
                    .strip_prefix('{')
                    .and_then(|r| r.strip_suffix('}'))
                    .ok_or_else(|| invalid("unbalanced braces".to_string()))?;
                (name_part.trim(), Some(body))
            },
        };
        if !name_part.is_empty() {
            matchers.push(LabelMatcher::equal(METRIC_NAME_LABEL, name_part)?);
        }
        if let Some(body) = body {
            for matcher in body.split(',') {
                let matcher = matcher.trim();
                if matcher.is_empty() {
                    continue;
                }
                let op_at = matcher
                    .find(['=', '!'])
                    .ok_or_else(|| invalid(format!("no operator in {matcher:?}")))?;
                let (name, rest) = matcher.split_at(op_at);
                let (matcher_type, value) = if let Some(v) = rest.strip_prefix("=~") {
                    (MatcherType::RegexMatch, v)
                } else if let Some(v) = rest.strip_prefix("!~") {
                    (MatcherType::RegexNoMatch, v)
                } else if let Some(v) = rest.strip_prefix("!=") {
                    (MatcherType::NotEqual, v)
                } else if let Some(v) = rest.strip_prefix('=') {
                    (MatcherType::Equal, v)
                } else {
                    return Err(invalid(format!("bad operator in {matcher:?}")));
                };
                let value = value.trim();
                let unquoted = ['"', '\'']
                    .iter()
                    .find_map(|q| value.strip_prefix(*q)?.strip_suffix(*q))
                    .ok_or_else(|| invalid(format!("unquoted value in {matcher:?}")))?;
                matchers.push(LabelMatcher::new(matcher_type, name.trim(), unquoted)?);
            }
        }
        if matchers.is_empty() {
            return Err(invalid("selector matches nothing".to_string()));
        }
        Ok(matchers)
    }
}

#[async_trait]
impl QueryEngine for SelectorQueryEngine {
    async fn eval(&self, query: &str, at_ms: i64) -> anyhow::Result<Vec<TimeSeries>> {
        let matchers = Self::parse_selector(query)?;
        let t0 = (at_ms - self.lookback_ms).max(0);
        self.store.query(&matchers, t0, at_ms + 1)
    }
}

#[derive(Clone, Debug)]
struct DerivedMetricRule {
    name: String,
    query: String,
    interval_ms: i64,
    last_executed_at: i64,
}

/// Background scheduler that executes derived-metric rules on their
/// intervals and writes the renamed results back through the filtering
/// decorator.
pub struct DerivedMetricManager {
    storage: Arc<FilteringStorage>,
    engine: Arc<dyn QueryEngine>,
    rules: Mutex<Vec<DerivedMetricRule>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

impl DerivedMetricManager {
    pub fn new(storage: Arc<FilteringStorage>, engine: Arc<dyn QueryEngine>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            storage,
            engine,
            rules: Mutex::new(Vec::new()),
            shutdown_tx,
            task: Mutex::new(None),
        })
    }

    pub fn add_rule(
        &self,
        name: impl Into<String>,
        query: impl Into<String>,
        interval_ms: i64,
    ) -> anyhow::Result<()> {
        let name = name.into();
        common::labels::validate_label_name(&name)?;
        if interval_ms <= 0 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "NonPositiveInterval",
                format!("derived metric {name} has interval {interval_ms}ms"),
            ));
        }
        self.rules.lock().push(DerivedMetricRule {
            name,
            query: query.into(),
            interval_ms,
            last_executed_at: 0,
        });
        Ok(())
    }

    pub fn clear_rules(&self) {
        self.rules.lock().clear();
    }

    /// Start the background loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            let tick = Duration::from_millis(*knobs::DERIVED_METRICS_TICK_MS);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(tick) => {},
                    _ = shutdown_rx.changed() => break,
                }
                manager.run_pending(now_ms()).await;
            }
            tracing::debug!("derived metrics scheduler stopped");
        }));
    }

    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Execute every rule due at `now_ms`. Exposed for tests, which drive
    /// time explicitly instead of sleeping.
    pub async fn run_pending(&self, now_ms: i64) {
        let due: Vec<DerivedMetricRule> = {
            let mut rules = self.rules.lock();
            rules
                .iter_mut()
                .filter(|rule| rule.last_executed_at + rule.interval_ms <= now_ms)
                .map(|rule| {
                    // Advance before executing so a failing rule does not
                    // retry on every tick.
                    rule.last_executed_at = now_ms;
                    rule.clone()
                })
                .collect()
        };
        for rule in due {
            if let Err(e) = self.execute_rule(&rule, now_ms).await {
                tracing::warn!("derived metric {} failed: {e:#}", rule.name);
            }
        }
    }

    async fn execute_rule(&self, rule: &DerivedMetricRule, now_ms: i64) -> anyhow::Result<()> {
        let results = self.engine.eval(&rule.query, now_ms).await?;
        let mut written = 0usize;
        for series in results {
            let mut labels = series.labels().clone();
            labels.add(METRIC_NAME_LABEL, rule.name.clone())?;
            let renamed =
                TimeSeries::from_parts(labels, series.samples().to_vec())?;
            self.storage.write(renamed).await?;
            written += 1;
        }
        tracing::debug!("derived metric {} wrote {written} series", rule.name);
        Ok(())
    }
}
