use std::sync::Arc;

use common::{
    LabelMatcher,
    Labels,
    TimeSeries,
};
use rules::RuleManager;

use crate::engine::TimeSeriesStore;

/// Decorator that applies the current rule set before delegating writes to
/// the store. Every other operation passes through unchanged.
pub struct FilteringStorage {
    inner: Arc<TimeSeriesStore>,
    rule_manager: Arc<RuleManager>,
}

impl FilteringStorage {
    pub fn new(inner: Arc<TimeSeriesStore>, rule_manager: Arc<RuleManager>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            rule_manager,
        })
    }

    pub fn rule_manager(&self) -> &Arc<RuleManager> {
        &self.rule_manager
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.inner
    }

    /// Apply the drop check, then the mapping rules, then delegate. The
    /// rule set is acquired once per call; a concurrent rule update
    /// affects the next write, never a write in progress.
    pub async fn write(&self, series: TimeSeries) -> anyhow::Result<()> {
        let rule_set = self.rule_manager.get_current_rules();
        if rule_set.should_drop(&series) {
            self.inner
                .metrics()
                .samples_dropped_by_rules
                .inc_by(series.samples().len() as u64);
            return Ok(());
        }
        let series = rule_set.apply_mapping(series);
        self.inner.write(series).await
    }

    pub fn read(&self, labels: &Labels, t0: i64, t1: i64) -> anyhow::Result<TimeSeries> {
        self.inner.read(labels, t0, t1)
    }

    pub fn query(
        &self,
        matchers: &[LabelMatcher],
        t0: i64,
        t1: i64,
    ) -> anyhow::Result<Vec<TimeSeries>> {
        self.inner.query(matchers, t0, t1)
    }

    pub fn label_names(&self) -> Vec<String> {
        self.inner.label_names()
    }

    pub fn label_values(&self, label_name: &str) -> Vec<String> {
        self.inner.label_values(label_name)
    }

    pub fn delete_series(&self, matchers: &[LabelMatcher]) -> anyhow::Result<usize> {
        self.inner.delete_series(matchers)
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        self.inner.flush().await
    }

    pub async fn compact(&self) -> anyhow::Result<()> {
        self.inner.compact().await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }

    pub fn stats(&self) -> String {
        self.inner.stats()
    }
}
