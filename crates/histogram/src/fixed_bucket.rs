use std::mem;

use errors::ErrorMetadata;
use parking_lot::Mutex;

#[derive(Default, Debug)]
struct HistogramState {
    // bounds.len() + 1 buckets: (-inf, b0), [b0, b1), ..., [b_last, +inf).
    counts: Vec<u64>,
    total_count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

/// Histogram over explicit, finite, strictly ascending bucket bounds.
#[derive(Debug)]
pub struct FixedBucketHistogram {
    bounds: Vec<f64>,
    state: Mutex<HistogramState>,
}

impl FixedBucketHistogram {
    pub fn new(bounds: Vec<f64>) -> anyhow::Result<Self> {
        if bounds.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "EmptyHistogramBounds",
                "bucket bounds must not be empty",
            ));
        }
        if bounds.iter().any(|b| !b.is_finite()) {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "NonFiniteHistogramBound",
                "bucket bounds must be finite",
            ));
        }
        if bounds.windows(2).any(|w| w[1] <= w[0]) {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "UnsortedHistogramBounds",
                "bucket bounds must be strictly ascending",
            ));
        }
        let buckets = bounds.len() + 1;
        Ok(Self {
            bounds,
            state: Mutex::new(HistogramState {
                counts: vec![0; buckets],
                ..Default::default()
            }),
        })
    }

    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    fn bucket_index(&self, value: f64) -> usize {
        // upper_bound: the first bound strictly greater than the value.
        self.bounds.partition_point(|&b| b <= value)
    }

    fn bucket_range(&self, index: usize) -> (f64, f64) {
        let lower = if index == 0 {
            f64::NEG_INFINITY
        } else {
            self.bounds[index - 1]
        };
        let upper = if index == self.bounds.len() {
            f64::INFINITY
        } else {
            self.bounds[index]
        };
        (lower, upper)
    }

    pub fn add(&self, value: f64) -> anyhow::Result<()> {
        self.add_count(value, 1)
    }

    pub fn add_count(&self, value: f64, count: u64) -> anyhow::Result<()> {
        if value.is_nan() {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "NanHistogramValue",
                "cannot add NaN to a fixed-bucket histogram",
            ));
        }
        if count == 0 {
            return Ok(());
        }
        let index = self.bucket_index(value);
        let mut state = self.state.lock();
        state.counts[index] += count;
        state.total_count += count;
        state.sum += value * count as f64;
        state.min = Some(state.min.map_or(value, |m| m.min(value)));
        state.max = Some(state.max.map_or(value, |m| m.max(value)));
        Ok(())
    }

    /// Merge another histogram with identical bounds into this one.
    pub fn merge(&self, other: &FixedBucketHistogram) -> anyhow::Result<()> {
        if self.bounds != other.bounds {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "HistogramBoundsMismatch",
                "cannot merge histograms with different bucket bounds",
            ));
        }
        let (other_counts, other_total, other_sum, other_min, other_max) = {
            let guard = other.state.lock();
            (
                guard.counts.clone(),
                guard.total_count,
                guard.sum,
                guard.min,
                guard.max,
            )
        };
        let mut state = self.state.lock();
        for (mine, theirs) in state.counts.iter_mut().zip(other_counts) {
            *mine += theirs;
        }
        state.total_count += other_total;
        state.sum += other_sum;
        state.min = match (state.min, other_min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        state.max = match (state.max, other_max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    /// Estimate the `q`-quantile by linear interpolation inside the
    /// selected bucket. The unbounded edge buckets fall back to the stored
    /// min and max.
    pub fn quantile(&self, q: f64) -> anyhow::Result<f64> {
        if !(0.0..=1.0).contains(&q) {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "InvalidQuantile",
                format!("quantile must be in [0, 1], got {q}"),
            ));
        }
        let state = self.state.lock();
        if state.total_count == 0 {
            return Ok(0.0);
        }
        let rank = (q * state.total_count as f64) as u64;
        let mut cumulative = 0u64;
        let mut selected = state.counts.len() - 1;
        let mut bucket_count = 0u64;
        for (index, &count) in state.counts.iter().enumerate() {
            cumulative += count;
            if cumulative > rank {
                selected = index;
                bucket_count = count;
                break;
            }
        }
        let (lower, upper) = self.bucket_range(selected);
        if lower.is_infinite() {
            return Ok(state.min.expect("non-empty histogram tracks min"));
        }
        if upper.is_infinite() {
            return Ok(state.max.expect("non-empty histogram tracks max"));
        }
        if bucket_count == 0 {
            // The walk ran off the end without crossing the rank, which can
            // only leave us in the +inf bucket handled above.
            return Ok(state.max.expect("non-empty histogram tracks max"));
        }
        let position = rank - (cumulative - bucket_count);
        let fraction = position as f64 / bucket_count as f64;
        Ok(lower + fraction * (upper - lower))
    }

    pub fn count(&self) -> u64 {
        self.state.lock().total_count
    }

    pub fn sum(&self) -> f64 {
        self.state.lock().sum
    }

    pub fn min(&self) -> Option<f64> {
        self.state.lock().min
    }

    pub fn max(&self) -> Option<f64> {
        self.state.lock().max
    }

    /// Per-bucket counts, leading with the `(-inf, b0)` bucket.
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.state.lock().counts.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.counts.iter_mut().for_each(|c| *c = 0);
        state.total_count = 0;
        state.sum = 0.0;
        state.min = None;
        state.max = None;
    }

    pub fn size_bytes(&self) -> usize {
        let state = self.state.lock();
        mem::size_of::<Self>()
            + self.bounds.capacity() * mem::size_of::<f64>()
            + state.counts.capacity() * mem::size_of::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::FixedBucketHistogram;

    #[test]
    fn test_construction_validation() {
        for bounds in [
            vec![],
            vec![1.0, 1.0],
            vec![2.0, 1.0],
            vec![1.0, f64::INFINITY],
            vec![f64::NAN],
        ] {
            let err = FixedBucketHistogram::new(bounds.clone()).unwrap_err();
            assert!(err.is_invalid_argument(), "{bounds:?} should be rejected");
        }
        FixedBucketHistogram::new(vec![0.0, 1.0, 10.0]).unwrap();
    }

    #[test]
    fn test_bucket_assignment_uses_upper_bound() {
        let hist = FixedBucketHistogram::new(vec![0.0, 10.0, 20.0]).unwrap();
        hist.add(-5.0).unwrap(); // (-inf, 0)
        hist.add(0.0).unwrap(); // [0, 10)
        hist.add(10.0).unwrap(); // [10, 20)
        hist.add(25.0).unwrap(); // [20, +inf)
        assert_eq!(hist.bucket_counts(), vec![1, 1, 1, 1]);
        assert_eq!(hist.count(), 4);
    }

    #[test]
    fn test_quantile_interpolates_within_bucket() {
        let hist = FixedBucketHistogram::new(vec![0.0, 100.0]).unwrap();
        // 10 values spread in [0, 100).
        for i in 0..10 {
            hist.add(i as f64 * 10.0).unwrap();
        }
        let median = hist.quantile(0.5).unwrap();
        // rank 5 of 10 in a [0, 100) bucket interpolates to 50.
        assert!((median - 50.0).abs() < 1e-9, "median {median}");
    }

    #[test]
    fn test_edge_buckets_return_extremes() {
        let hist = FixedBucketHistogram::new(vec![0.0]).unwrap();
        hist.add(-7.0).unwrap();
        hist.add(3.0).unwrap();
        assert_eq!(hist.quantile(0.0).unwrap(), -7.0);
        assert_eq!(hist.quantile(1.0).unwrap(), 3.0);
    }

    #[test]
    fn test_merge_requires_identical_bounds() {
        let a = FixedBucketHistogram::new(vec![0.0, 1.0]).unwrap();
        let b = FixedBucketHistogram::new(vec![0.0, 2.0]).unwrap();
        let err = a.merge(&b).unwrap_err();
        assert_eq!(err.short_msg(), "HistogramBoundsMismatch");
    }

    #[test]
    fn test_merge_adds_bucket_counts() {
        let a = FixedBucketHistogram::new(vec![0.0, 1.0]).unwrap();
        let b = FixedBucketHistogram::new(vec![0.0, 1.0]).unwrap();
        a.add(0.5).unwrap();
        b.add(0.5).unwrap();
        b.add(5.0).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.bucket_counts(), vec![0, 2, 1]);
        assert_eq!(a.count(), 3);
        assert_eq!(a.max(), Some(5.0));
    }

    #[test]
    fn test_nan_rejected() {
        let hist = FixedBucketHistogram::new(vec![0.0]).unwrap();
        let err = hist.add(f64::NAN).unwrap_err();
        assert_eq!(err.short_msg(), "NanHistogramValue");
    }
}
