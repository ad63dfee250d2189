//! Approximate-quantile histogram structures used when ingesting
//! distribution metrics.
//!
//! Two variants with a shared surface:
//!
//! - [`DdSketch`]: an exponential relative-error sketch. Bucket boundaries
//!   grow geometrically by `gamma = (1 + alpha) / (1 - alpha)`, bounding
//!   the relative error of any quantile estimate by `alpha`. Buckets are
//!   sparse; only populated indices are retained.
//! - [`FixedBucketHistogram`]: explicit finite bounds `b_0 < ... < b_{n-1}`
//!   covering `(-inf, b_0), [b_0, b_1), ..., [b_{n-1}, +inf)`.
//!
//! Both maintain count, sum, min and max, merge only with same-parameter
//! peers, and take an internal mutex so concurrent add/merge/query needs
//! no external synchronization.

mod ddsketch;
mod fixed_bucket;

pub use ddsketch::DdSketch;
pub use fixed_bucket::FixedBucketHistogram;
