use std::collections::{
    HashMap,
    HashSet,
};

use common::TimeSeries;
use regex::Regex;

/// A node of the metric-name prefix trie. Cloning is a deep copy, which is
/// what the copy-on-write update path relies on.
#[derive(Clone, Debug, Default)]
struct TrieNode {
    children: HashMap<char, TrieNode>,
    // A terminal node: any name passing through here matches the prefix.
    is_leaf: bool,
}

impl TrieNode {
    fn insert(&mut self, prefix: &str) {
        let mut node = self;
        for ch in prefix.chars() {
            node = node.children.entry(ch).or_default();
        }
        node.is_leaf = true;
    }

    fn matches_prefix_of(&self, name: &str) -> bool {
        let mut node = self;
        if node.is_leaf {
            return true;
        }
        for ch in name.chars() {
            match node.children.get(&ch) {
                Some(child) => {
                    node = child;
                    if node.is_leaf {
                        return true;
                    }
                },
                None => return false,
            }
        }
        false
    }

    fn is_empty(&self) -> bool {
        !self.is_leaf && self.children.is_empty()
    }
}

/// Drop rules scoped to one label name.
#[derive(Clone, Debug, Default)]
pub struct LabelRules {
    exact_values: HashSet<String>,
    regex_values: Vec<Regex>,
}

impl LabelRules {
    fn matches(&self, value: &str) -> bool {
        self.exact_values.contains(value) || self.regex_values.iter().any(|re| re.is_match(value))
    }

    fn is_empty(&self) -> bool {
        self.exact_values.is_empty() && self.regex_values.is_empty()
    }
}

/// Rewrite `(label_name, old_value)` to `new_value` on matching series.
#[derive(Clone, Debug)]
pub struct MappingRule {
    pub label_name: String,
    pub old_value: String,
    pub new_value: String,
}

/// A compiled rule set optimized for the hot write path. Immutable once
/// published; updates build a new set.
#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    drop_exact_names: HashSet<String>,
    drop_prefix_names: TrieNode,
    drop_regex_names: Vec<Regex>,
    drop_label_rules: HashMap<String, LabelRules>,
    mapping_rules: Vec<MappingRule>,
}

impl RuleSet {
    /// Evaluate the drop predicate: exact name, then name prefix, then name
    /// regex, then per-label rules.
    pub fn should_drop(&self, series: &TimeSeries) -> bool {
        let name = series.name().unwrap_or("");
        if self.drop_exact_names.contains(name) {
            return true;
        }
        if self.drop_prefix_names.matches_prefix_of(name) {
            return true;
        }
        if self.drop_regex_names.iter().any(|re| re.is_match(name)) {
            return true;
        }
        for (label_name, label_value) in series.labels().iter_ordered() {
            if let Some(rules) = self.drop_label_rules.get(label_name) {
                if rules.matches(label_value) {
                    return true;
                }
            }
        }
        false
    }

    /// Rewrite labels per the mapping rules, returning a new series when
    /// anything matched. Applied after the drop check.
    pub fn apply_mapping(&self, series: TimeSeries) -> TimeSeries {
        let mut series = series;
        for rule in &self.mapping_rules {
            if series.labels().get(&rule.label_name) == Some(rule.old_value.as_str()) {
                // The new value went through validation when the rule was
                // added, so re-adding cannot fail.
                let _ = series
                    .labels_mut()
                    .add(rule.label_name.clone(), rule.new_value.clone());
            }
        }
        series
    }

    pub fn is_empty(&self) -> bool {
        self.drop_exact_names.is_empty()
            && self.drop_prefix_names.is_empty()
            && self.drop_regex_names.is_empty()
            && self.drop_label_rules.is_empty()
            && self.mapping_rules.is_empty()
    }

    pub(crate) fn add_drop_exact_name(&mut self, name: impl Into<String>) {
        self.drop_exact_names.insert(name.into());
    }

    pub(crate) fn add_drop_prefix(&mut self, prefix: &str) {
        self.drop_prefix_names.insert(prefix);
    }

    pub(crate) fn add_drop_name_regex(&mut self, regex: Regex) {
        self.drop_regex_names.push(regex);
    }

    pub(crate) fn add_drop_label_exact(
        &mut self,
        label_name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.drop_label_rules
            .entry(label_name.into())
            .or_default()
            .exact_values
            .insert(value.into());
    }

    pub(crate) fn add_drop_label_regex(&mut self, label_name: impl Into<String>, regex: Regex) {
        self.drop_label_rules
            .entry(label_name.into())
            .or_default()
            .regex_values
            .push(regex);
    }

    pub(crate) fn add_mapping_rule(&mut self, rule: MappingRule) {
        self.mapping_rules.push(rule);
    }
}
