use std::sync::Arc;

use arc_swap::ArcSwap;
use common::labels::validate_label_name;
use errors::ErrorMetadata;
use parking_lot::Mutex;

use crate::{
    rule_set::{
        MappingRule,
        RuleSet,
    },
    selector::parse_selector_into_rules,
};

/// Publishes rule sets copy-on-write. Rule updates are rare; reads happen
/// on every write, so readers must never lock.
pub struct RuleManager {
    current: ArcSwap<RuleSet>,
    // Serializes writers. Readers never touch this.
    update_lock: Mutex<()>,
}

impl RuleManager {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
            update_lock: Mutex::new(()),
        }
    }

    /// Acquire the current rule set. The returned handle stays valid (and
    /// unchanged) across concurrent updates; the set it points at is
    /// reclaimed when the last holder drops it.
    pub fn get_current_rules(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    /// Add a drop rule from a Prometheus-style selector. A parse failure
    /// leaves the published rule set unchanged.
    pub fn add_drop_rule(&self, selector: &str) -> anyhow::Result<()> {
        let _guard = self.update_lock.lock();
        let mut next = RuleSet::clone(&self.current.load());
        parse_selector_into_rules(&mut next, selector)?;
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// Add a label mapping rule rewriting `(label_name, old_value)` to
    /// `new_value`.
    pub fn add_mapping_rule(
        &self,
        label_name: impl Into<String>,
        old_value: impl Into<String>,
        new_value: impl Into<String>,
    ) -> anyhow::Result<()> {
        let label_name = label_name.into();
        let new_value = new_value.into();
        validate_label_name(&label_name)?;
        if new_value.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "EmptyMappingValue",
                format!("mapping for label {label_name} has an empty replacement value"),
            ));
        }
        let _guard = self.update_lock.lock();
        let mut next = RuleSet::clone(&self.current.load());
        next.add_mapping_rule(MappingRule {
            label_name,
            old_value: old_value.into(),
            new_value,
        });
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// Replace the published rule set with an empty one.
    pub fn clear_rules(&self) {
        let _guard = self.update_lock.lock();
        self.current.store(Arc::new(RuleSet::default()));
    }
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        Labels,
        TimeSeries,
    };

    use super::RuleManager;

    fn series(name: &str) -> TimeSeries {
        TimeSeries::new(Labels::from_pairs([("__name__", name)]).unwrap())
    }

    #[test]
    fn test_updates_publish_new_set() {
        let manager = RuleManager::new();
        assert!(!manager.get_current_rules().should_drop(&series("up")));
        manager.add_drop_rule("up").unwrap();
        assert!(manager.get_current_rules().should_drop(&series("up")));
        manager.clear_rules();
        assert!(!manager.get_current_rules().should_drop(&series("up")));
    }

    #[test]
    fn test_readers_keep_observing_their_acquired_set() {
        let manager = RuleManager::new();
        manager.add_drop_rule("old_metric").unwrap();
        let held = manager.get_current_rules();

        manager.add_drop_rule("new_metric").unwrap();

        // The held handle reflects the state at acquisition time.
        assert!(held.should_drop(&series("old_metric")));
        assert!(!held.should_drop(&series("new_metric")));
        // A fresh acquisition observes both rules.
        let fresh = manager.get_current_rules();
        assert!(fresh.should_drop(&series("old_metric")));
        assert!(fresh.should_drop(&series("new_metric")));
        // The two handles are distinct sets, not a mutated shared one.
        assert!(!Arc::ptr_eq(&held, &fresh));
    }

    #[test]
    fn test_parse_failure_leaves_manager_unchanged() {
        let manager = RuleManager::new();
        manager.add_drop_rule("keep_me").unwrap();
        let before = manager.get_current_rules();
        assert!(manager.add_drop_rule("{env!='dev'}").is_err());
        let after = manager.get_current_rules();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_mapping_rules_published() {
        let manager = RuleManager::new();
        manager.add_mapping_rule("env", "stage", "staging").unwrap();
        let rules = manager.get_current_rules();
        let mut s = series("cpu");
        s.labels_mut().add("env", "stage").unwrap();
        let mapped = rules.apply_mapping(s);
        assert_eq!(mapped.labels().get("env"), Some("staging"));
        assert!(manager.add_mapping_rule("bad name", "a", "b").is_err());
        assert!(manager.add_mapping_rule("env", "a", "").is_err());
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let manager = Arc::new(RuleManager::new());
        let mut handles = Vec::new();
        for i in 0..4 {
            let manager = manager.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    manager.add_drop_rule(&format!("metric_{i}_{j}")).unwrap();
                    let rules = manager.get_current_rules();
                    // A set acquired after our own update must contain it.
                    assert!(rules.should_drop(&series(&format!("metric_{i}_{j}"))));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let rules = manager.get_current_rules();
        assert!(rules.should_drop(&series("metric_0_0")));
        assert!(rules.should_drop(&series("metric_3_49")));
    }
}
