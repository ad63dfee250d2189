use std::{
    collections::BTreeMap,
    fmt,
    hash::Hasher,
    sync::LazyLock,
};

use errors::ErrorMetadata;
use fnv::FnvHasher;
use regex::Regex;
use serde::{
    Deserialize,
    Serialize,
};

/// The reserved label key that holds the metric name.
pub const METRIC_NAME_LABEL: &str = "__name__";

static LABEL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex must compile"));

/// A 64-bit stable hash of a label set's canonical serialization, used to
/// address a series without carrying the full label set on the hot write
/// path. Collisions are resolved by full label comparison in the series
/// registry.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An ordered key -> value mapping with unique keys. Two label sets are
/// equal iff they contain the same pairs; insertion order is irrelevant to
/// identity. Keys must match `[A-Za-z_][A-Za-z0-9_]*` and values must be
/// non-empty UTF-8.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels {
    map: BTreeMap<String, String>,
}

impl Labels {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Insert a pair, replacing any existing value for the key. Later
    /// writers win, which is load-bearing for OTLP attribute merging.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> anyhow::Result<()> {
        let name = name.into();
        let value = value.into();
        validate_label_name(&name)?;
        if value.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "EmptyLabelValue",
                format!("label {name} has an empty value"),
            ));
        }
        self.map.insert(name, value);
        Ok(())
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> anyhow::Result<Self> {
        let mut labels = Self::new();
        for (name, value) in pairs {
            labels.add(name, value)?;
        }
        Ok(labels)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.map.get(name).map(|v| v.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.map.remove(name)
    }

    /// The metric name, if the reserved `__name__` label is present.
    pub fn name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    /// Pairs in lexicographic key order.
    pub fn iter_ordered(&self) -> impl Iterator<Item = (&str, &str)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// The canonical serialization used for hashing: `k=v` pairs in key
    /// order, each terminated by a comma.
    pub fn canonical_string(&self) -> String {
        let mut out = String::new();
        for (name, value) in self.iter_ordered() {
            out.push_str(name);
            out.push('=');
            out.push_str(value);
            out.push(',');
        }
        out
    }

    /// FNV-1a 64 over the canonical serialization. FNV is stable across
    /// processes, which the on-disk block metadata relies on.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = FnvHasher::default();
        hasher.write(self.canonical_string().as_bytes());
        Fingerprint(hasher.finish())
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (name, value)) in self.iter_ordered().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value:?}")?;
        }
        write!(f, "}}")
    }
}

pub fn validate_label_name(name: &str) -> anyhow::Result<()> {
    if !LABEL_NAME_RE.is_match(name) {
        anyhow::bail!(ErrorMetadata::invalid_argument(
            "InvalidLabelName",
            format!("label name {name:?} must match [A-Za-z_][A-Za-z0-9_]*"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;
    use proptest::prelude::*;

    use super::{
        Labels,
        METRIC_NAME_LABEL,
    };

    #[test]
    fn test_identity_ignores_insertion_order() -> anyhow::Result<()> {
        let a = Labels::from_pairs([("host", "h1"), (METRIC_NAME_LABEL, "cpu")])?;
        let b = Labels::from_pairs([(METRIC_NAME_LABEL, "cpu"), ("host", "h1")])?;
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        Ok(())
    }

    #[test]
    fn test_canonical_string_is_key_ordered() -> anyhow::Result<()> {
        let labels = Labels::from_pairs([("zone", "us"), ("app", "web")])?;
        assert_eq!(labels.canonical_string(), "app=web,zone=us,");
        Ok(())
    }

    #[test]
    fn test_add_replaces_existing_value() -> anyhow::Result<()> {
        let mut labels = Labels::new();
        labels.add("env", "dev")?;
        labels.add("env", "prod")?;
        assert_eq!(labels.get("env"), Some("prod"));
        assert_eq!(labels.len(), 1);
        Ok(())
    }

    #[test]
    fn test_rejects_invalid_names_and_empty_values() {
        let mut labels = Labels::new();
        for bad in ["", "0abc", "a-b", "sp ace"] {
            let err = labels.add(bad, "v").unwrap_err();
            assert!(err.is_invalid_argument(), "{bad:?} should be rejected");
        }
        let err = labels.add("ok", "").unwrap_err();
        assert_eq!(err.short_msg(), "EmptyLabelValue");
    }

    #[test]
    fn test_name_accessor() -> anyhow::Result<()> {
        let labels = Labels::from_pairs([(METRIC_NAME_LABEL, "cpu")])?;
        assert_eq!(labels.name(), Some("cpu"));
        assert_eq!(Labels::new().name(), None);
        Ok(())
    }

    proptest! {
        #[test]
        fn proptest_fingerprint_matches_equality(
            pairs in proptest::collection::btree_map("[a-z_][a-z0-9_]{0,8}", "[a-z0-9]{1,8}", 0..6),
            extra_key in "[a-z_][a-z0-9_]{0,8}",
        ) {
            let labels = Labels::from_pairs(pairs.clone()).unwrap();
            let roundtrip = Labels::from_pairs(pairs.clone()).unwrap();
            prop_assert_eq!(labels.fingerprint(), roundtrip.fingerprint());

            let mut perturbed = labels.clone();
            perturbed.add(extra_key.clone(), "zz9").unwrap();
            if perturbed != labels {
                prop_assert_ne!(perturbed.fingerprint(), labels.fingerprint());
            }
        }
    }
}
