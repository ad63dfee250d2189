use anyhow::Context;
use errors::ErrorMetadata;
use regex::Regex;

use crate::labels::{
    validate_label_name,
    Labels,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatcherType {
    Equal,
    NotEqual,
    RegexMatch,
    RegexNoMatch,
}

/// A predicate over a single label. An absent label is treated as the
/// empty string, matching the Prometheus data model.
#[derive(Clone, Debug)]
pub struct LabelMatcher {
    matcher_type: MatcherType,
    name: String,
    value: String,
    // Compiled, whole-value-anchored pattern for the regex variants.
    regex: Option<Regex>,
}

impl LabelMatcher {
    pub fn new(
        matcher_type: MatcherType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let name = name.into();
        let value = value.into();
        validate_label_name(&name)?;
        let regex = match matcher_type {
            MatcherType::Equal | MatcherType::NotEqual => None,
            MatcherType::RegexMatch | MatcherType::RegexNoMatch => {
                let anchored = format!("^(?:{value})$");
                let compiled = Regex::new(&anchored)
                    .map_err(|e| {
                        ErrorMetadata::invalid_argument(
                            "InvalidMatcherRegex",
                            format!("invalid regex {value:?} for label {name}: {e}"),
                        )
                    })
                    .context("compiling label matcher")?;
                Some(compiled)
            },
        };
        Ok(Self {
            matcher_type,
            name,
            value,
            regex,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> anyhow::Result<Self> {
        Self::new(MatcherType::Equal, name, value)
    }

    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> anyhow::Result<Self> {
        Self::new(MatcherType::RegexMatch, name, pattern)
    }

    pub fn matcher_type(&self) -> MatcherType {
        self.matcher_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// True if this matcher only accepts one exact, non-empty value. Such
    /// matchers can be served from an inverted index without a scan.
    pub fn is_exact(&self) -> bool {
        self.matcher_type == MatcherType::Equal && !self.value.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        let observed = labels.get(&self.name).unwrap_or("");
        match self.matcher_type {
            MatcherType::Equal => observed == self.value,
            MatcherType::NotEqual => observed != self.value,
            MatcherType::RegexMatch => self
                .regex
                .as_ref()
                .expect("regex matcher always compiles its pattern")
                .is_match(observed),
            MatcherType::RegexNoMatch => !self
                .regex
                .as_ref()
                .expect("regex matcher always compiles its pattern")
                .is_match(observed),
        }
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::{
        LabelMatcher,
        MatcherType,
    };
    use crate::labels::Labels;

    fn labels() -> Labels {
        Labels::from_pairs([("__name__", "cpu_usage"), ("host", "h1")]).unwrap()
    }

    #[test]
    fn test_equal_and_not_equal() -> anyhow::Result<()> {
        assert!(LabelMatcher::equal("host", "h1")?.matches(&labels()));
        assert!(!LabelMatcher::equal("host", "h2")?.matches(&labels()));
        assert!(LabelMatcher::new(MatcherType::NotEqual, "host", "h2")?.matches(&labels()));
        Ok(())
    }

    #[test]
    fn test_absent_label_is_empty_string() -> anyhow::Result<()> {
        // NotEqual on an absent label compares against "".
        assert!(LabelMatcher::new(MatcherType::NotEqual, "zone", "us")?.matches(&labels()));
        assert!(!LabelMatcher::equal("zone", "us")?.matches(&labels()));
        // An empty-pattern regex accepts the absent label.
        assert!(LabelMatcher::regex("zone", "")?.matches(&labels()));
        Ok(())
    }

    #[test]
    fn test_regex_is_anchored() -> anyhow::Result<()> {
        // "cpu" must not match "cpu_usage" as a substring.
        assert!(!LabelMatcher::regex("__name__", "cpu")?.matches(&labels()));
        assert!(LabelMatcher::regex("__name__", "cpu.*")?.matches(&labels()));
        assert!(LabelMatcher::new(MatcherType::RegexNoMatch, "__name__", "mem.*")?
            .matches(&labels()));
        Ok(())
    }

    #[test]
    fn test_invalid_regex_rejected_at_construction() {
        let err = LabelMatcher::regex("host", "h[1").unwrap_err();
        assert!(err.is_invalid_argument());
        assert_eq!(err.short_msg(), "InvalidMatcherRegex");
    }
}
