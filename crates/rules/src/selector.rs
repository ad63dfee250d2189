//! Parser for the Prometheus-style selector strings accepted by
//! [`RuleManager::add_drop_rule`](crate::RuleManager::add_drop_rule).
//!
//! Supported forms:
//!
//! - `metric_name`: exact name drop
//! - `metric_name*`: name prefix drop
//! - `{__name__="v"}` / `{__name__=~"re"}`: exact / regex name drop
//! - `{label="v"}` / `{label=~"re"}`: per-label drops
//! - `metric_name{label="v", ...}`: name drop plus label drops
//!
//! Values may be quoted with single or double quotes. Negated matchers
//! (`!=`, `!~`) cannot express a drop rule and are rejected. A regex of
//! the form `prefix.*` is compiled into the prefix trie instead of the
//! regex list.

use common::{
    labels::validate_label_name,
    METRIC_NAME_LABEL,
};
use errors::ErrorMetadata;
use regex::Regex;

use crate::rule_set::RuleSet;

fn parse_error(selector: &str, detail: impl std::fmt::Display) -> anyhow::Error {
    ErrorMetadata::invalid_argument(
        "InvalidSelector",
        format!("cannot parse selector {selector:?}: {detail}"),
    )
    .into()
}

/// Anchor a selector regex the way matcher regexes are anchored: the
/// pattern must cover the whole value.
fn compile_anchored(selector: &str, pattern: &str) -> anyhow::Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| parse_error(selector, format_args!("invalid regex {pattern:?}: {e}")))
}

/// A regex that is a literal name followed by `.*` is just a prefix match;
/// route it to the trie, which is cheaper than the regex list.
fn as_prefix_pattern(pattern: &str) -> Option<&str> {
    let prefix = pattern.strip_suffix(".*")?;
    if !prefix.is_empty()
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
    {
        Some(prefix)
    } else {
        None
    }
}

fn unquote(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    for quote in ['"', '\''] {
        if let Some(rest) = raw.strip_prefix(quote) {
            return rest.strip_suffix(quote);
        }
    }
    None
}

fn apply_matcher(
    rules: &mut RuleSet,
    selector: &str,
    name: &str,
    op: &str,
    value: &str,
) -> anyhow::Result<()> {
    validate_label_name(name).map_err(|e| parse_error(selector, e))?;
    match (name == METRIC_NAME_LABEL, op) {
        (true, "=") => rules.add_drop_exact_name(value),
        (true, "=~") => match as_prefix_pattern(value) {
            Some(prefix) => rules.add_drop_prefix(prefix),
            None => rules.add_drop_name_regex(compile_anchored(selector, value)?),
        },
        (false, "=") => rules.add_drop_label_exact(name, value),
        (false, "=~") => {
            let regex = compile_anchored(selector, value)?;
            rules.add_drop_label_regex(name, regex);
        },
        (_, "!=") | (_, "!~") => {
            return Err(parse_error(
                selector,
                format_args!("negated matcher {op} cannot express a drop rule"),
            ));
        },
        (_, other) => {
            return Err(parse_error(selector, format_args!("unknown operator {other:?}")));
        },
    }
    Ok(())
}

fn parse_matcher_list(rules: &mut RuleSet, selector: &str, body: &str) -> anyhow::Result<()> {
    let body = body.trim();
    if body.is_empty() {
        return Err(parse_error(selector, "empty matcher list"));
    }
    for matcher in body.split(',') {
        let matcher = matcher.trim();
        let op_at = matcher
            .find(['=', '!'])
            .ok_or_else(|| parse_error(selector, format_args!("no operator in {matcher:?}")))?;
        let (name, rest) = matcher.split_at(op_at);
        let op_len = match rest.as_bytes() {
            [b'=', b'~', ..] | [b'!', b'=', ..] | [b'!', b'~', ..] => 2,
            [b'=', ..] => 1,
            _ => return Err(parse_error(selector, format_args!("bad operator in {matcher:?}"))),
        };
        let (op, raw_value) = rest.split_at(op_len);
        let value = unquote(raw_value)
            .ok_or_else(|| parse_error(selector, format_args!("unquoted value in {matcher:?}")))?;
        apply_matcher(rules, selector, name.trim(), op, value)?;
    }
    Ok(())
}

/// Parse `selector` and add the corresponding drop rules to `rules`. On
/// any failure `rules` may be partially updated; the caller works on a
/// scratch copy and discards it on error.
pub(crate) fn parse_selector_into_rules(rules: &mut RuleSet, selector: &str) -> anyhow::Result<()> {
    let trimmed = selector.trim();
    if trimmed.is_empty() {
        return Err(parse_error(selector, "empty selector"));
    }
    match trimmed.find('{') {
        None => {
            if let Some(prefix) = trimmed.strip_suffix('*') {
                if prefix.is_empty() {
                    return Err(parse_error(selector, "bare wildcard would drop everything"));
                }
                rules.add_drop_prefix(prefix);
            } else {
                validate_label_name(trimmed).map_err(|e| parse_error(selector, e))?;
                rules.add_drop_exact_name(trimmed);
            }
            Ok(())
        },
        Some(open) => {
            let (name_part, rest) = trimmed.split_at(open);
            let body = rest
                .strip_prefix('{')
                .and_then(|r| r.strip_suffix('}'))
                .ok_or_else(|| parse_error(selector, "unbalanced braces"))?;
            let name_part = name_part.trim();
            if !name_part.is_empty() {
                validate_label_name(name_part).map_err(|e| parse_error(selector, e))?;
                rules.add_drop_exact_name(name_part);
            }
            parse_matcher_list(rules, selector, body)
        },
    }
}
