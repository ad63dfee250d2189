//! Write-time filtering and mapping rules.
//!
//! A [`RuleSet`] is compiled for fast lookup and immutable once published.
//! The [`RuleManager`] publishes rule sets copy-on-write: readers on the
//! hot write path acquire the current set without locking, writers rebuild
//! a fresh set under an update lock and swap the pointer atomically.
//! Readers already holding an older set keep observing it until they drop
//! their handle.

mod manager;
mod rule_set;
mod selector;

pub use manager::RuleManager;
pub use rule_set::{
    MappingRule,
    RuleSet,
};
