use errors::ErrorMetadata;
use serde::{
    Deserialize,
    Serialize,
};

use crate::labels::Labels;

/// A single measurement: Unix-millisecond timestamp and value. NaN and
/// infinite values are representable; validity of the timestamp is
/// enforced by the write path, not here.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// A labeled stream of samples, strictly monotonically increasing in
/// timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct TimeSeries {
    labels: Labels,
    samples: Vec<Sample>,
}

impl TimeSeries {
    pub fn new(labels: Labels) -> Self {
        Self {
            labels,
            samples: Vec::new(),
        }
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub fn labels_mut(&mut self) -> &mut Labels {
        &mut self.labels
    }

    pub fn name(&self) -> Option<&str> {
        self.labels.name()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<i64> {
        self.samples.last().map(|s| s.timestamp_ms)
    }

    /// Append a sample, enforcing strict timestamp monotonicity. Duplicate
    /// and out-of-order timestamps fail.
    pub fn add_sample(&mut self, timestamp_ms: i64, value: f64) -> anyhow::Result<()> {
        if let Some(last) = self.last_timestamp() {
            if timestamp_ms <= last {
                anyhow::bail!(ErrorMetadata::invalid_argument(
                    "NonMonotonicTimestamp",
                    format!(
                        "sample timestamp {timestamp_ms} is not newer than the series tail at \
                         {last}"
                    ),
                ));
            }
        }
        self.samples.push(Sample::new(timestamp_ms, value));
        Ok(())
    }

    /// Concatenate another series with identical labels onto this one.
    /// Overlapping time ranges fail; `other`'s samples must all be newer
    /// than this series' tail.
    pub fn merge(&mut self, other: TimeSeries) -> anyhow::Result<()> {
        if self.labels != other.labels {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "MergeLabelMismatch",
                format!(
                    "cannot merge series {} into series {}",
                    other.labels, self.labels
                ),
            ));
        }
        if let (Some(last), Some(first)) =
            (self.last_timestamp(), other.samples.first().map(|s| s.timestamp_ms))
        {
            if first <= last {
                anyhow::bail!(ErrorMetadata::invalid_argument(
                    "MergeOverlap",
                    format!(
                        "merged samples start at {first}, which overlaps the series tail at \
                         {last}"
                    ),
                ));
            }
        }
        self.samples.extend(other.samples);
        Ok(())
    }

    /// Build a series from samples already known to be ordered, e.g. read
    /// back from a sealed block.
    pub fn from_parts(labels: Labels, samples: Vec<Sample>) -> anyhow::Result<Self> {
        for window in samples.windows(2) {
            if window[1].timestamp_ms <= window[0].timestamp_ms {
                anyhow::bail!(ErrorMetadata::invalid_argument(
                    "NonMonotonicTimestamp",
                    format!(
                        "sample stream is not strictly increasing at timestamp {}",
                        window[1].timestamp_ms
                    ),
                ));
            }
        }
        Ok(Self { labels, samples })
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::TimeSeries;
    use crate::labels::Labels;

    fn series() -> TimeSeries {
        TimeSeries::new(Labels::from_pairs([("__name__", "cpu")]).unwrap())
    }

    #[test]
    fn test_add_sample_enforces_monotonicity() {
        let mut ts = series();
        ts.add_sample(1000, 0.5).unwrap();
        ts.add_sample(2000, 0.6).unwrap();
        for bad in [2000, 1500] {
            let err = ts.add_sample(bad, 0.7).unwrap_err();
            assert_eq!(err.short_msg(), "NonMonotonicTimestamp");
        }
        assert_eq!(ts.samples().len(), 2);
    }

    #[test]
    fn test_nan_and_infinite_values_are_permitted() {
        let mut ts = series();
        ts.add_sample(1, f64::NAN).unwrap();
        ts.add_sample(2, f64::INFINITY).unwrap();
        ts.add_sample(3, f64::NEG_INFINITY).unwrap();
        assert!(ts.samples()[0].value.is_nan());
    }

    #[test]
    fn test_merge_concatenates_and_rejects_overlap() {
        let mut a = series();
        a.add_sample(1000, 1.0).unwrap();
        let mut b = series();
        b.add_sample(2000, 2.0).unwrap();
        a.merge(b.clone()).unwrap();
        assert_eq!(a.samples().len(), 2);

        // b's samples are no longer newer than a's tail.
        let err = a.merge(b).unwrap_err();
        assert_eq!(err.short_msg(), "MergeOverlap");
    }

    #[test]
    fn test_merge_requires_identical_labels() {
        let mut a = series();
        let b = TimeSeries::new(Labels::from_pairs([("__name__", "mem")]).unwrap());
        let err = a.merge(b).unwrap_err();
        assert!(err.is_invalid_argument());
    }
}
