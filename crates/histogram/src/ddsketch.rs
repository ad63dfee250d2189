use std::{
    collections::BTreeMap,
    mem,
};

use errors::ErrorMetadata;
use parking_lot::Mutex;

// Clamp added values into the normal double range so the bucket index
// stays finite.
const MIN_TRACKABLE: f64 = 1e-308;
const MAX_TRACKABLE: f64 = 1e308;

#[derive(Default)]
struct SketchState {
    // Sparse: only populated indices are retained.
    buckets: BTreeMap<i32, u64>,
    total_count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
}

/// Exponential relative-error sketch for positive values.
pub struct DdSketch {
    alpha: f64,
    gamma: f64,
    // 1 / ln(gamma), hoisted out of the per-add index computation.
    multiplier: f64,
    state: Mutex<SketchState>,
}

impl DdSketch {
    pub fn new(alpha: f64) -> anyhow::Result<Self> {
        if !(alpha > 0.0 && alpha < 1.0) {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "InvalidSketchAlpha",
                format!("alpha must be in (0, 1), got {alpha}"),
            ));
        }
        let gamma = 1.0 + 2.0 * alpha / (1.0 - alpha);
        Ok(Self {
            alpha,
            gamma,
            multiplier: 1.0 / gamma.ln(),
            state: Mutex::new(SketchState::default()),
        })
    }

    pub fn relative_error(&self) -> f64 {
        self.alpha
    }

    fn value_to_index(&self, value: f64) -> i32 {
        let clamped = value.clamp(MIN_TRACKABLE, MAX_TRACKABLE);
        (clamped.ln() * self.multiplier).ceil() as i32
    }

    fn index_to_value(&self, index: i32) -> f64 {
        self.gamma.powi(index)
    }

    pub fn add(&self, value: f64) -> anyhow::Result<()> {
        self.add_count(value, 1)
    }

    pub fn add_count(&self, value: f64, count: u64) -> anyhow::Result<()> {
        if value.is_nan() || value <= 0.0 {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "NonPositiveSketchValue",
                format!("sketch only supports positive values, got {value}"),
            ));
        }
        if count == 0 {
            return Ok(());
        }
        let index = self.value_to_index(value);
        let mut state = self.state.lock();
        *state.buckets.entry(index).or_insert(0) += count;
        state.total_count += count;
        state.sum += value * count as f64;
        state.min = Some(state.min.map_or(value, |m| m.min(value)));
        state.max = Some(state.max.map_or(value, |m| m.max(value)));
        Ok(())
    }

    /// Merge another sketch into this one. Only sketches constructed with
    /// the same `alpha` share bucket boundaries and can be merged.
    pub fn merge(&self, other: &DdSketch) -> anyhow::Result<()> {
        if self.alpha != other.alpha {
            anyhow::bail!(ErrorMetadata::invalid_argument(
                "SketchParameterMismatch",
                format!(
                    "cannot merge sketches with alpha {} and {}",
                    self.alpha, other.alpha
                ),
            ));
        }
        let other_state = {
            let guard = other.state.lock();
            SketchState {
                buckets: guard.buckets.clone(),
                total_count: guard.total_count,
                sum: guard.sum,
                min: guard.min,
                max: guard.max,
            }
        };
        let mut state = self.state.lock();
        for (index, count) in other_state.buckets {
            *state.buckets.entry(index).or_insert(0) += count;
        }
        state.total_count += other_state.total_count;
        state.sum += other_state.sum;
        state.min = match (state.min, other_state.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        state.max = match (state.max, other_state.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    /// Estimate the `q`-quantile. Walks the sparse buckets in ascending
    /// index order until the cumulative count passes `q * total_count`,
    /// then returns the midpoint estimator `2 * gamma^i / (gamma + 1)` for
    /// the selected bucket, clamped into `[min, max]`. The midpoint (and
    /// not a bucket boundary) is what keeps the relative error within
    /// `alpha` for any value in the bucket.
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
        let mut selected = None;
        let mut cumulative = 0u64;
        for (&index, &count) in &state.buckets {
            cumulative += count;
            if cumulative > rank {
                selected = Some(index);
                break;
            }
        }
        let index = selected.unwrap_or_else(|| {
            *state
                .buckets
                .keys()
                .next_back()
                .expect("non-empty sketch has a last bucket")
        });
        let estimate = 2.0 * self.index_to_value(index) / (self.gamma + 1.0);
        // Boundary extrapolation: the stored extremes are exact.
        let low = state.min.expect("non-empty sketch tracks min");
        let high = state.max.expect("non-empty sketch tracks max");
        Ok(estimate.clamp(low, high))
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

    /// Populated `(bucket_index, count)` pairs in ascending index order.
    pub fn buckets(&self) -> Vec<(i32, u64)> {
        self.state
            .lock()
            .buckets
            .iter()
            .map(|(&i, &c)| (i, c))
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = SketchState::default();
    }

    /// Approximate resident size.
    pub fn size_bytes(&self) -> usize {
        let state = self.state.lock();
        mem::size_of::<Self>() + state.buckets.len() * mem::size_of::<(i32, u64)>()
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::DdSketch;

    #[test]
    fn test_rejects_bad_alpha() {
        for alpha in [0.0, 1.0, -0.5, f64::NAN] {
            assert!(DdSketch::new(alpha).is_err(), "alpha {alpha} should fail");
        }
    }

    #[test]
    fn test_rejects_non_positive_and_nan_values() {
        let sketch = DdSketch::new(0.01).unwrap();
        for value in [0.0, -1.0, f64::NAN] {
            let err = sketch.add(value).unwrap_err();
            assert_eq!(err.short_msg(), "NonPositiveSketchValue");
        }
        assert_eq!(sketch.count(), 0);
    }

    #[test]
    fn test_count_sum_min_max() {
        let sketch = DdSketch::new(0.05).unwrap();
        for value in [2.0, 8.0, 4.0] {
            sketch.add(value).unwrap();
        }
        sketch.add_count(1.0, 3).unwrap();
        assert_eq!(sketch.count(), 6);
        assert!((sketch.sum() - 17.0).abs() < 1e-9);
        assert_eq!(sketch.min(), Some(1.0));
        assert_eq!(sketch.max(), Some(8.0));
    }

    #[test]
    fn test_quantile_error_bound_powers_of_ten() {
        let alpha = 0.01;
        let sketch = DdSketch::new(alpha).unwrap();
        for i in 0..=10 {
            sketch.add(10f64.powi(i)).unwrap();
        }
        for i in 0..=10 {
            let expected = 10f64.powi(i);
            let estimate = sketch.quantile(i as f64 / 10.0).unwrap();
            let relative = (estimate - expected).abs() / expected;
            assert!(
                relative <= alpha,
                "q={} estimate={estimate} expected={expected} err={relative}",
                i as f64 / 10.0,
            );
        }
    }

    #[test]
    fn test_quantile_error_bound_dense_range() {
        let alpha = 0.02;
        let sketch = DdSketch::new(alpha).unwrap();
        let values: Vec<f64> = (1..=1000).map(|i| i as f64 * 0.5).collect();
        for &value in &values {
            sketch.add(value).unwrap();
        }
        for q in [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 0.99, 1.0] {
            let rank = ((q * values.len() as f64) as usize).min(values.len() - 1);
            let expected = values[rank];
            let estimate = sketch.quantile(q).unwrap();
            let relative = (estimate - expected).abs() / expected;
            assert!(
                relative <= alpha + 1e-9,
                "q={q} estimate={estimate} expected={expected} err={relative}",
            );
        }
    }

    #[test]
    fn test_merge_requires_same_alpha() {
        let a = DdSketch::new(0.01).unwrap();
        let b = DdSketch::new(0.02).unwrap();
        let err = a.merge(&b).unwrap_err();
        assert_eq!(err.short_msg(), "SketchParameterMismatch");
    }

    #[test]
    fn test_merge_combines_counts_and_extremes() {
        let a = DdSketch::new(0.01).unwrap();
        let b = DdSketch::new(0.01).unwrap();
        a.add(1.0).unwrap();
        b.add(100.0).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.count(), 2);
        assert_eq!(a.min(), Some(1.0));
        assert_eq!(a.max(), Some(100.0));
    }

    #[test]
    fn test_empty_sketch_quantile_is_zero() {
        let sketch = DdSketch::new(0.01).unwrap();
        assert_eq!(sketch.quantile(0.5).unwrap(), 0.0);
        assert!(sketch.quantile(1.5).is_err());
    }

    #[test]
    fn test_size_bytes_grows_with_buckets() {
        let sketch = DdSketch::new(0.01).unwrap();
        let empty = sketch.size_bytes();
        for i in 1..=100 {
            sketch.add(i as f64).unwrap();
        }
        assert!(sketch.size_bytes() > empty);
    }
}
