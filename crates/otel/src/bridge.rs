use std::sync::Arc;

use common::{
    Labels,
    TimeSeries,
    METRIC_NAME_LABEL,
};
use histogram::FixedBucketHistogram;
use opentelemetry_proto::tonic::{
    common::v1::{
        any_value,
        KeyValue,
    },
    metrics::v1::{
        metric::Data,
        number_data_point,
        HistogramDataPoint,
        Metric,
        NumberDataPoint,
    },
};
use storage::FilteringStorage;

/// Label distinguishing the component series a histogram data point is
/// linearized into: `count`, `sum`, or `bucket_<i>`.
pub const COMPONENT_LABEL: &str = "__component__";

/// Upper-bound label carried by histogram bucket series.
pub const LE_LABEL: &str = "le";

/// Converts OTLP metrics into internal series and writes them through the
/// filtering decorator. Per-metric failures are counted and logged; they
/// never fail the surrounding export.
pub struct OtelBridge {
    storage: Arc<FilteringStorage>,
}

/// Attribute keys pass through Prometheus-style sanitization: characters
/// outside `[A-Za-z0-9_]` become underscores, and a leading digit gets an
/// underscore prefix. Empty keys are skipped by the caller.
fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for (i, ch) in key.chars().enumerate() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            if i == 0 && ch.is_ascii_digit() {
                out.push('_');
            }
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

/// Coerce OTLP attributes to string pairs. Strings, bools, ints, and
/// doubles convert; array and kv-list values are skipped, as are empty
/// keys and empty values.
fn convert_attributes(attributes: &[KeyValue]) -> Vec<(String, String)> {
    let mut out = Vec::with_capacity(attributes.len());
    for kv in attributes {
        if kv.key.is_empty() {
            continue;
        }
        let Some(value) = kv.value.as_ref().and_then(|v| v.value.as_ref()) else {
            continue;
        };
        let value = match value {
            any_value::Value::StringValue(s) => s.clone(),
            any_value::Value::BoolValue(b) => b.to_string(),
            any_value::Value::IntValue(i) => i.to_string(),
            any_value::Value::DoubleValue(d) => d.to_string(),
            _ => continue,
        };
        if value.is_empty() {
            continue;
        }
        out.push((sanitize_key(&kv.key), value));
    }
    out
}

fn point_value(point: &NumberDataPoint) -> Option<f64> {
    match point.value.as_ref()? {
        number_data_point::Value::AsDouble(value) => Some(*value),
        number_data_point::Value::AsInt(value) => Some(*value as f64),
    }
}

fn nanos_to_millis(time_unix_nano: u64) -> i64 {
    (time_unix_nano / 1_000_000) as i64
}

fn format_bound(bound: f64) -> String {
    if bound.is_infinite() {
        "+Inf".to_string()
    } else {
        format!("{bound}")
    }
}

/// Reject malformed histogram points before they are linearized, by
/// rebuilding the distribution with the engine's own histogram type. This
/// catches unsorted or non-finite bounds, a bucket/bound arity mismatch,
/// and a count that disagrees with the buckets.
fn validate_histogram_point(point: &HistogramDataPoint) -> anyhow::Result<()> {
    if point.bucket_counts.is_empty() {
        return Ok(());
    }
    if point.bucket_counts.len() != point.explicit_bounds.len() + 1 {
        anyhow::bail!(errors::ErrorMetadata::invalid_argument(
            "HistogramArityMismatch",
            format!(
                "{} bucket counts for {} bounds",
                point.bucket_counts.len(),
                point.explicit_bounds.len()
            ),
        ));
    }
    if point.explicit_bounds.is_empty() {
        // A single (-inf, +inf) bucket is legal; there is no bound
        // structure left to check beyond the count.
        if point.bucket_counts[0] != point.count {
            anyhow::bail!(errors::ErrorMetadata::invalid_argument(
                "HistogramCountMismatch",
                format!(
                    "declared count {} but buckets hold {}",
                    point.count, point.bucket_counts[0]
                ),
            ));
        }
        return Ok(());
    }
    let histogram = FixedBucketHistogram::new(point.explicit_bounds.clone())?;
    for (i, &count) in point.bucket_counts.iter().enumerate() {
        // A representative value inside each bucket: below the first
        // bound, or the inclusive lower bound otherwise.
        let representative = if i == 0 {
            point.explicit_bounds[0] - 1.0
        } else {
            point.explicit_bounds[i - 1]
        };
        histogram.add_count(representative, count)?;
    }
    if histogram.count() != point.count {
        anyhow::bail!(errors::ErrorMetadata::invalid_argument(
            "HistogramCountMismatch",
            format!(
                "declared count {} but buckets hold {}",
                point.count,
                histogram.count()
            ),
        ));
    }
    Ok(())
}

impl OtelBridge {
    pub fn new(storage: Arc<FilteringStorage>) -> Arc<Self> {
        Arc::new(Self { storage })
    }

    /// Convert and store one export request. Returns the number of metrics
    /// dropped as unsupported or invalid.
    pub async fn export(
        &self,
        resource_metrics: Vec<opentelemetry_proto::tonic::metrics::v1::ResourceMetrics>,
    ) -> anyhow::Result<usize> {
        let metrics = self.storage.store().metrics().clone();
        let mut dropped = 0usize;
        for resource in resource_metrics {
            let resource_attrs = resource
                .resource
                .as_ref()
                .map(|r| convert_attributes(&r.attributes))
                .unwrap_or_default();
            for scope_metrics in resource.scope_metrics {
                let scope_attrs = scope_metrics
                    .scope
                    .as_ref()
                    .map(|s| convert_attributes(&s.attributes))
                    .unwrap_or_default();
                for metric in scope_metrics.metrics {
                    match self
                        .convert_metric(&metric, &resource_attrs, &scope_attrs)
                        .await
                    {
                        Ok(points) => {
                            metrics.otel_data_points.inc_by(points as u64);
                        },
                        Err(e) => {
                            tracing::warn!("dropping metric {}: {e:#}", metric.name);
                            metrics.otel_metrics_dropped.inc();
                            dropped += 1;
                        },
                    }
                }
            }
        }
        Ok(dropped)
    }

    /// Base labels = resource attributes ∪ scope attributes ∪ `__name__`;
    /// later wins on key conflict, with the data point's own attributes
    /// applied last.
    fn base_labels(
        &self,
        metric: &Metric,
        resource_attrs: &[(String, String)],
        scope_attrs: &[(String, String)],
    ) -> anyhow::Result<Labels> {
        let mut labels = Labels::new();
        for (key, value) in resource_attrs.iter().chain(scope_attrs) {
            labels.add(key.clone(), value.clone())?;
        }
        labels.add(METRIC_NAME_LABEL, metric.name.clone())?;
        Ok(labels)
    }

    async fn convert_metric(
        &self,
        metric: &Metric,
        resource_attrs: &[(String, String)],
        scope_attrs: &[(String, String)],
    ) -> anyhow::Result<usize> {
        let base = self.base_labels(metric, resource_attrs, scope_attrs)?;
        match &metric.data {
            Some(Data::Gauge(gauge)) => self.write_number_points(&base, &gauge.data_points).await,
            // Sum values are stored as-is; monotonicity metadata does not
            // change the stored samples.
            Some(Data::Sum(sum)) => self.write_number_points(&base, &sum.data_points).await,
            Some(Data::Histogram(histogram)) => {
                let mut points = 0;
                for point in &histogram.data_points {
                    points += self.write_histogram_point(&base, point).await?;
                }
                Ok(points)
            },
            Some(Data::ExponentialHistogram(_)) => {
                anyhow::bail!("exponential histograms are not supported")
            },
            Some(Data::Summary(_)) => anyhow::bail!("summaries are not supported"),
            None => anyhow::bail!("metric carries no data"),
        }
    }

    async fn write_number_points(
        &self,
        base: &Labels,
        points: &[NumberDataPoint],
    ) -> anyhow::Result<usize> {
        let mut written = 0;
        for point in points {
            let Some(value) = point_value(point) else {
                continue;
            };
            let mut labels = base.clone();
            for (key, attr_value) in convert_attributes(&point.attributes) {
                labels.add(key, attr_value)?;
            }
            let mut series = TimeSeries::new(labels);
            series.add_sample(nanos_to_millis(point.time_unix_nano), value)?;
            self.storage.write(series).await?;
            written += 1;
        }
        Ok(written)
    }

    /// A histogram data point becomes one series per component: `count`,
    /// `sum`, and `bucket_<i>` (the latter tagged with its `le` upper
    /// bound), all at the point's native timestamp.
    async fn write_histogram_point(
        &self,
        base: &Labels,
        point: &HistogramDataPoint,
    ) -> anyhow::Result<usize> {
        validate_histogram_point(point)?;
        let timestamp_ms = nanos_to_millis(point.time_unix_nano);
        let mut labels = base.clone();
        for (key, value) in convert_attributes(&point.attributes) {
            labels.add(key, value)?;
        }

        let mut written = 0;
        let write_component = |component: String,
                               le: Option<String>,
                               value: f64|
         -> anyhow::Result<TimeSeries> {
            let mut labels = labels.clone();
            labels.add(COMPONENT_LABEL, component)?;
            if let Some(le) = le {
                labels.add(LE_LABEL, le)?;
            }
            let mut series = TimeSeries::new(labels);
            series.add_sample(timestamp_ms, value)?;
            Ok(series)
        };

        self.storage
            .write(write_component("count".to_string(), None, point.count as f64)?)
            .await?;
        written += 1;
        if let Some(sum) = point.sum {
            self.storage
                .write(write_component("sum".to_string(), None, sum)?)
                .await?;
            written += 1;
        }
        for (i, &count) in point.bucket_counts.iter().enumerate() {
            let bound = point
                .explicit_bounds
                .get(i)
                .copied()
                .unwrap_or(f64::INFINITY);
            self.storage
                .write(write_component(
                    format!("bucket_{i}"),
                    Some(format_bound(bound)),
                    count as f64,
                )?)
                .await?;
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use common::{
        LabelMatcher,
        StorageConfig,
    };
    use metrics::StorageMetrics;
    use opentelemetry_proto::tonic::{
        common::v1::{
            any_value,
            AnyValue,
            InstrumentationScope,
            KeyValue,
        },
        metrics::v1::{
            metric::Data,
            number_data_point,
            Gauge,
            HistogramDataPoint,
            Metric,
            NumberDataPoint,
            ResourceMetrics,
            ScopeMetrics,
            Summary,
        },
        resource::v1::Resource,
    };
    use rules::RuleManager;
    use storage::{
        FilteringStorage,
        TimeSeriesStore,
    };

    use super::{
        sanitize_key,
        OtelBridge,
    };

    fn string_attr(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    fn gauge_metric(name: &str, points: Vec<NumberDataPoint>) -> Metric {
        Metric {
            name: name.to_string(),
            data: Some(Data::Gauge(Gauge {
                data_points: points,
            })),
            ..Default::default()
        }
    }

    fn export_request(metrics: Vec<Metric>) -> Vec<ResourceMetrics> {
        vec![ResourceMetrics {
            resource: Some(Resource {
                attributes: vec![string_attr("service.name", "api")],
                ..Default::default()
            }),
            scope_metrics: vec![ScopeMetrics {
                scope: Some(InstrumentationScope {
                    attributes: vec![string_attr("scope_attr", "sv")],
                    ..Default::default()
                }),
                metrics,
                ..Default::default()
            }],
            ..Default::default()
        }]
    }

    fn test_stack(dir: &tempfile::TempDir) -> (Arc<TimeSeriesStore>, Arc<OtelBridge>) {
        let store = TimeSeriesStore::new(
            StorageConfig::with_data_dir(dir.path()),
            StorageMetrics::new().unwrap(),
        )
        .unwrap();
        let filtering = FilteringStorage::new(store.clone(), Arc::new(RuleManager::new()));
        (store, OtelBridge::new(filtering))
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("service.name"), "service_name");
        assert_eq!(sanitize_key("attr0"), "attr0");
        assert_eq!(sanitize_key("0starts_digit"), "_0starts_digit");
        assert_eq!(sanitize_key("host-name"), "host_name");
    }

    #[tokio::test]
    async fn test_gauge_with_many_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let (store, bridge) = test_stack(&dir);

        let attributes: Vec<KeyValue> = (0..40)
            .map(|i| string_attr(&format!("attr{i}"), &format!("val{i}")))
            .collect();
        let point = NumberDataPoint {
            attributes,
            time_unix_nano: 1_234_567_890_000_000_000,
            value: Some(number_data_point::Value::AsDouble(42.5)),
            ..Default::default()
        };
        let dropped = bridge
            .export(export_request(vec![gauge_metric("test_metric", vec![point])]))
            .await
            .unwrap();
        assert_eq!(dropped, 0);

        let matchers = vec![
            LabelMatcher::equal("__name__", "test_metric").unwrap(),
            LabelMatcher::equal("attr0", "val0").unwrap(),
        ];
        let results = store
            .query(&matchers, 1_234_567_889_000, 1_234_567_891_000)
            .unwrap();
        assert_eq!(results.len(), 1);
        let series = &results[0];
        // __name__ + 40 attributes + resource and scope attributes.
        assert!(series.labels().len() >= 41, "{}", series.labels());
        assert_eq!(series.labels().get("service_name"), Some("api"));
        assert_eq!(series.samples().len(), 1);
        assert_eq!(series.samples()[0].timestamp_ms, 1_234_567_890_000);
        assert_eq!(series.samples()[0].value, 42.5);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_point_attributes_win_over_resource() {
        let dir = tempfile::tempdir().unwrap();
        let (store, bridge) = test_stack(&dir);

        let point = NumberDataPoint {
            attributes: vec![string_attr("service.name", "pointwise")],
            time_unix_nano: 1_000_000_000,
            value: Some(number_data_point::Value::AsInt(7)),
            ..Default::default()
        };
        bridge
            .export(export_request(vec![gauge_metric("m", vec![point])]))
            .await
            .unwrap();

        let results = store
            .query(&[LabelMatcher::equal("__name__", "m").unwrap()], 0, 10_000)
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].labels().get("service_name"), Some("pointwise"));
        assert_eq!(results[0].samples()[0].value, 7.0);

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_histogram_linearizes_into_component_series() {
        let dir = tempfile::tempdir().unwrap();
        let (store, bridge) = test_stack(&dir);

        let point = HistogramDataPoint {
            time_unix_nano: 5_000_000_000,
            count: 6,
            sum: Some(12.5),
            bucket_counts: vec![1, 4, 1],
            explicit_bounds: vec![1.0, 5.0],
            ..Default::default()
        };
        let metric = Metric {
            name: "latency".to_string(),
            data: Some(Data::Histogram(
                opentelemetry_proto::tonic::metrics::v1::Histogram {
                    data_points: vec![point],
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        bridge.export(export_request(vec![metric])).await.unwrap();

        let all = store
            .query(
                &[LabelMatcher::equal("__name__", "latency").unwrap()],
                0,
                10_000,
            )
            .unwrap();
        // count + sum + 3 buckets.
        assert_eq!(all.len(), 5);

        let count = store
            .query(
                &[
                    LabelMatcher::equal("__name__", "latency").unwrap(),
                    LabelMatcher::equal("__component__", "count").unwrap(),
                ],
                0,
                10_000,
            )
            .unwrap();
        assert_eq!(count.len(), 1);
        assert_eq!(count[0].samples()[0].timestamp_ms, 5_000);
        assert_eq!(count[0].samples()[0].value, 6.0);

        let last_bucket = store
            .query(
                &[
                    LabelMatcher::equal("__name__", "latency").unwrap(),
                    LabelMatcher::equal("__component__", "bucket_2").unwrap(),
                ],
                0,
                10_000,
            )
            .unwrap();
        assert_eq!(last_bucket[0].labels().get("le"), Some("+Inf"));

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_histogram_point_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (store, bridge) = test_stack(&dir);

        // Declared count disagrees with the bucket counts.
        let point = HistogramDataPoint {
            time_unix_nano: 1_000_000_000,
            count: 99,
            bucket_counts: vec![1, 1],
            explicit_bounds: vec![10.0],
            ..Default::default()
        };
        let metric = Metric {
            name: "broken".to_string(),
            data: Some(Data::Histogram(
                opentelemetry_proto::tonic::metrics::v1::Histogram {
                    data_points: vec![point],
                    ..Default::default()
                },
            )),
            ..Default::default()
        };
        let dropped = bridge.export(export_request(vec![metric])).await.unwrap();
        assert_eq!(dropped, 1);
        assert!(store.label_values("__name__").is_empty());

        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_kinds_counted_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (store, bridge) = test_stack(&dir);

        let summary = Metric {
            name: "quantiles".to_string(),
            data: Some(Data::Summary(Summary::default())),
            ..Default::default()
        };
        let no_data = Metric {
            name: "hollow".to_string(),
            ..Default::default()
        };
        let good = gauge_metric("ok_metric", vec![NumberDataPoint {
            time_unix_nano: 1_000_000,
            value: Some(number_data_point::Value::AsDouble(1.0)),
            ..Default::default()
        }]);
        let dropped = bridge
            .export(export_request(vec![summary, no_data, good]))
            .await
            .unwrap();
        assert_eq!(dropped, 2);
        // Processing continued past the unsupported metrics.
        assert_eq!(store.label_values("__name__"), vec!["ok_metric"]);

        store.close().await.unwrap();
    }
}
