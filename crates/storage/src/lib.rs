//! The ingestion/storage core: time-bucketed per-series blocks, a
//! fingerprint-sharded write pipeline, the label/matcher query engine,
//! write-time filtering, and the derived-metric scheduler.
//!
//! # Shape
//!
//! [`TimeSeriesStore`] owns the series registry and the block lifecycle.
//! Writes are routed by series fingerprint to one of N shard workers, so
//! samples for one series apply in submission order while different
//! series never contend. Each series handle owns a writable head block;
//! crossing a time, count, or size limit seals it into the immutable
//! sealed list, which a background flusher persists and a maintenance
//! task compacts and expires.
//!
//! [`FilteringStorage`] decorates the store with the rule engine, and
//! [`DerivedMetricManager`] periodically re-ingests query results as new
//! metrics through that decorator.

mod block;
mod derived;
mod disk;
mod engine;
mod filtering;
mod series;

pub use block::{
    BlockId,
    SealedBlock,
};
pub use derived::{
    DerivedMetricManager,
    QueryEngine,
    SelectorQueryEngine,
};
pub use engine::TimeSeriesStore;
pub use filtering::FilteringStorage;
