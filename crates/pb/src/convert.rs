use common::{
    LabelMatcher,
    Labels,
    MatcherType,
    TimeSeries,
};
use errors::ErrorMetadata;

use crate::remote;

/// Conversions between the remote protocol messages and internal types.
pub struct Converter;

impl Converter {
    /// Decode every series of a write request. Label and sample validation
    /// happens here, so a malformed request fails before anything reaches
    /// storage.
    pub fn from_write_request(request: remote::WriteRequest) -> anyhow::Result<Vec<TimeSeries>> {
        let mut result = Vec::with_capacity(request.timeseries.len());
        for proto_series in request.timeseries {
            result.push(Self::from_proto_series(proto_series)?);
        }
        Ok(result)
    }

    pub fn from_proto_series(proto_series: remote::TimeSeries) -> anyhow::Result<TimeSeries> {
        let mut labels = Labels::new();
        for label in proto_series.labels {
            labels.add(label.name, label.value)?;
        }
        let mut series = TimeSeries::new(labels);
        for sample in proto_series.samples {
            series.add_sample(sample.timestamp, sample.value)?;
        }
        Ok(series)
    }

    pub fn to_proto_series(series: &TimeSeries) -> remote::TimeSeries {
        remote::TimeSeries {
            labels: series
                .labels()
                .iter_ordered()
                .map(|(name, value)| remote::Label {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
            samples: series
                .samples()
                .iter()
                .map(|sample| remote::Sample {
                    value: sample.value,
                    timestamp: sample.timestamp_ms,
                })
                .collect(),
        }
    }

    /// One `QueryResult` holding all series matched by one query.
    pub fn to_query_result(series: &[TimeSeries]) -> remote::QueryResult {
        remote::QueryResult {
            timeseries: series.iter().map(Self::to_proto_series).collect(),
        }
    }

    pub fn from_proto_matcher(matcher: remote::LabelMatcher) -> anyhow::Result<LabelMatcher> {
        let matcher_type = match remote::label_matcher::Type::try_from(matcher.r#type) {
            Ok(remote::label_matcher::Type::Eq) => MatcherType::Equal,
            Ok(remote::label_matcher::Type::Neq) => MatcherType::NotEqual,
            Ok(remote::label_matcher::Type::Re) => MatcherType::RegexMatch,
            Ok(remote::label_matcher::Type::Nre) => MatcherType::RegexNoMatch,
            Err(_) => {
                anyhow::bail!(ErrorMetadata::invalid_argument(
                    "UnknownMatcherType",
                    format!("unknown matcher type {}", matcher.r#type),
                ))
            },
        };
        LabelMatcher::new(matcher_type, matcher.name, matcher.value)
    }

    pub fn to_proto_matcher(matcher: &LabelMatcher) -> remote::LabelMatcher {
        let matcher_type = match matcher.matcher_type() {
            MatcherType::Equal => remote::label_matcher::Type::Eq,
            MatcherType::NotEqual => remote::label_matcher::Type::Neq,
            MatcherType::RegexMatch => remote::label_matcher::Type::Re,
            MatcherType::RegexNoMatch => remote::label_matcher::Type::Nre,
        };
        remote::LabelMatcher {
            r#type: matcher_type as i32,
            name: matcher.name().to_string(),
            value: matcher.value().to_string(),
        }
    }
}
