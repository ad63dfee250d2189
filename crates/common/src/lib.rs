//! Core data model shared by every layer of the engine: label sets and
//! their fingerprints, matchers, samples and time series, configuration,
//! and the HTTP error envelope.

pub mod config;
pub mod http;
pub mod knobs;
pub mod labels;
pub mod matcher;
pub mod series;

pub use config::StorageConfig;
pub use labels::{
    Fingerprint,
    Labels,
    METRIC_NAME_LABEL,
};
pub use matcher::{
    LabelMatcher,
    MatcherType,
};
pub use series::{
    Sample,
    TimeSeries,
};
