use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stagewatch_config::{SloDefinition, SloIndicator};
use stagewatch_core::series::window_start;
use stagewatch_core::stats;
use stagewatch_core::{MetricError, MetricId, MetricKind, MetricRegistry, SeriesWindow};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Metric '{metric}' is a {actual}, expected {expected}")]
    IncompatibleKind {
        metric: String,
        actual: MetricKind,
        expected: &'static str,
    },

    #[error("Percentile must be in (0, 1], got {0}")]
    InvalidPercentile(f64),

    #[error(transparent)]
    Registry(MetricError),
}

impl From<MetricError> for QueryError {
    fn from(err: MetricError) -> Self {
        match err {
            MetricError::NotFound(metric) => QueryError::UnknownMetric(metric),
            other => QueryError::Registry(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloState {
    Compliant,
    Violated,
    /// Nothing was recorded inside the window.
    NoData,
    /// The definition could not be evaluated.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloWindow {
    pub seconds: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Result of evaluating one SLO. Computed on every read, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloStatus {
    pub name: String,
    pub value: Option<f64>,
    pub compliant: Option<bool>,
    pub status: SloState,
    pub comparator: String,
    pub threshold: f64,
    pub window: SloWindow,
    pub evaluated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct SloEvaluator {
    definitions: Vec<SloDefinition>,
}

impl SloEvaluator {
    pub fn new(definitions: Vec<SloDefinition>) -> Self {
        Self { definitions }
    }

    pub fn definitions(&self) -> &[SloDefinition] {
        &self.definitions
    }

    pub fn evaluate(&self, definition: &SloDefinition, registry: &MetricRegistry) -> Result<SloStatus, QueryError> {
        Self::evaluate_at(definition, registry, Utc::now())
    }

    /// Evaluates `definition` over the sliding window ending at `now`.
    pub fn evaluate_at(
        definition: &SloDefinition,
        registry: &MetricRegistry,
        now: DateTime<Utc>,
    ) -> Result<SloStatus, QueryError> {
        let window = Self::window(definition, now);
        let value = Self::compute(&definition.indicator, registry, window.start, window.end)?;

        let (compliant, status) = match value {
            Some(v) if definition.comparator.holds(v, definition.threshold) => (Some(true), SloState::Compliant),
            Some(_) => (Some(false), SloState::Violated),
            None => (None, SloState::NoData),
        };

        Ok(SloStatus {
            name: definition.name.clone(),
            value,
            compliant,
            status,
            comparator: definition.comparator.as_str().to_string(),
            threshold: definition.threshold,
            window,
            evaluated_at: now,
            error: None,
        })
    }

    pub fn evaluate_all(&self, registry: &MetricRegistry) -> Vec<SloStatus> {
        self.evaluate_all_at(registry, Utc::now())
    }

    /// Evaluates every definition; a failing one is reported as `unknown`
    /// without affecting the rest.
    pub fn evaluate_all_at(&self, registry: &MetricRegistry, now: DateTime<Utc>) -> Vec<SloStatus> {
        self.definitions
            .iter()
            .map(|definition| {
                Self::evaluate_at(definition, registry, now).unwrap_or_else(|err| {
                    warn!(slo = %definition.name, error = %err, "SLO evaluation failed");
                    SloStatus {
                        name: definition.name.clone(),
                        value: None,
                        compliant: None,
                        status: SloState::Unknown,
                        comparator: definition.comparator.as_str().to_string(),
                        threshold: definition.threshold,
                        window: Self::window(definition, now),
                        evaluated_at: now,
                        error: Some(err.to_string()),
                    }
                })
            })
            .collect()
    }

    fn window(definition: &SloDefinition, now: DateTime<Utc>) -> SloWindow {
        SloWindow {
            seconds: definition.window.as_secs(),
            start: window_start(now, definition.window),
            end: now,
        }
    }

    fn compute(
        indicator: &SloIndicator,
        registry: &MetricRegistry,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<f64>, QueryError> {
        match indicator {
            SloIndicator::Ratio { good, bad } => {
                let good = Self::fetch(registry, good.id(), from, to)?;
                let bad = Self::fetch(registry, bad.id(), from, to)?;
                expect_kind(&good, &[MetricKind::Counter], "counter")?;
                expect_kind(&bad, &[MetricKind::Counter], "counter")?;

                let successes = good.sum();
                let total = successes + bad.sum();
                Ok((total > 0.0).then(|| successes / total))
            }
            SloIndicator::Percentile { metric, percentile } => {
                if !(*percentile > 0.0 && *percentile <= 1.0) {
                    return Err(QueryError::InvalidPercentile(*percentile));
                }
                let window = Self::fetch(registry, metric.id(), from, to)?;
                expect_kind(
                    &window,
                    &[MetricKind::Histogram, MetricKind::Summary],
                    "histogram or summary",
                )?;

                if window.kind == MetricKind::Summary {
                    let mut values: Vec<f64> = window.samples.iter().map(|s| s.value).collect();
                    stats::sort_values(&mut values);
                    return Ok(stats::percentile(&values, *percentile));
                }

                let (Some(bounds), Some(counts)) = (window.bounds.as_deref(), window.bucket_counts()) else {
                    return Ok(None);
                };
                Ok(interpolate_percentile(bounds, counts, *percentile))
            }
            SloIndicator::Gauge { metric } => {
                let window = Self::fetch(registry, metric.id(), from, to)?;
                expect_kind(&window, &[MetricKind::Gauge], "gauge")?;
                Ok(window.latest().map(|s| s.value))
            }
        }
    }

    fn fetch(
        registry: &MetricRegistry,
        id: &MetricId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SeriesWindow, QueryError> {
        Ok(registry.window(id, from, to)?)
    }
}

fn expect_kind(window: &SeriesWindow, allowed: &[MetricKind], expected: &'static str) -> Result<(), QueryError> {
    if allowed.contains(&window.kind) {
        Ok(())
    } else {
        Err(QueryError::IncompatibleKind {
            metric: window.id.to_string(),
            actual: window.kind,
            expected,
        })
    }
}

/// Estimates a percentile from bucketed counts.
///
/// `counts` holds one non-cumulative count per bound plus a trailing `+Inf`
/// bucket. The target rank is `percentile * total`; inside the bucket that
/// contains it the value is interpolated linearly between the bucket's lower
/// and upper bound. Ranks landing in `+Inf` return the largest finite bound.
pub fn interpolate_percentile(bounds: &[f64], counts: &[u64], percentile: f64) -> Option<f64> {
    let total: u64 = counts.iter().sum();
    if total == 0 || bounds.is_empty() {
        return None;
    }

    let rank = percentile.clamp(0.0, 1.0) * total as f64;
    let mut cumulative = 0u64;

    for (i, &count) in counts.iter().enumerate() {
        if count > 0 && (cumulative + count) as f64 >= rank {
            let Some(&upper) = bounds.get(i) else {
                return bounds.last().copied();
            };
            let lower = match i {
                0 if upper > 0.0 => 0.0,
                0 => return Some(upper),
                _ => bounds[i - 1],
            };
            let fraction = (rank - cumulative as f64) / count as f64;
            return Some(lower + (upper - lower) * fraction);
        }
        cumulative += count;
    }

    bounds.last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stagewatch_config::Comparator;
    use std::time::Duration;

    const EPSILON: f64 = 1e-9;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn seconds_ago(s: i64) -> DateTime<Utc> {
        now() - chrono::Duration::seconds(s)
    }

    fn success() -> MetricId {
        MetricId::new("requests_total", [("outcome", "success")]).unwrap()
    }

    fn failure() -> MetricId {
        MetricId::new("requests_total", [("outcome", "failure")]).unwrap()
    }

    fn availability() -> SloDefinition {
        SloDefinition::builder()
            .name("availability")
            .ratio(success(), failure())
            .at_least(0.995)
            .window(Duration::from_secs(300))
            .build()
            .unwrap()
    }

    fn feed(registry: &MetricRegistry, successes: u32, failures: u32) {
        for i in 0..successes {
            registry
                .increment_counter_at(&success(), 1.0, seconds_ago(i64::from(i % 250)))
                .unwrap();
        }
        for i in 0..failures {
            registry
                .increment_counter_at(&failure(), 1.0, seconds_ago(i64::from(i % 250)))
                .unwrap();
        }
    }

    #[test]
    fn test_interpolation_matches_reference() {
        let bounds = [0.1, 0.2, 0.4, 0.8];
        let counts = [10, 20, 30, 40, 0];

        // rank 95 lands in (0.4, 0.8] with 35 of its 40 observations below.
        let p95 = interpolate_percentile(&bounds, &counts, 0.95).unwrap();
        assert!((p95 - (0.4 + 0.4 * 35.0 / 40.0)).abs() < EPSILON);

        // rank 50 lands in (0.2, 0.4] with 20 of its 30 observations below.
        let p50 = interpolate_percentile(&bounds, &counts, 0.50).unwrap();
        assert!((p50 - (0.2 + 0.2 * 20.0 / 30.0)).abs() < EPSILON);

        // rank 5 lands in the first bucket, interpolated from zero.
        let p05 = interpolate_percentile(&bounds, &counts, 0.05).unwrap();
        assert!((p05 - 0.05).abs() < EPSILON);
    }

    #[test]
    fn test_interpolation_edges() {
        assert_eq!(interpolate_percentile(&[1.0, 2.0], &[0, 0, 0], 0.5), None);
        assert_eq!(interpolate_percentile(&[1.0, 2.0], &[0, 0, 5], 0.5), Some(2.0));
        assert_eq!(interpolate_percentile(&[1.0, 2.0], &[0, 4, 0], 1.0), Some(2.0));
    }

    #[test]
    fn test_availability_compliant() {
        let registry = MetricRegistry::default();
        feed(&registry, 1000, 3);

        let status = SloEvaluator::evaluate_at(&availability(), &registry, now()).unwrap();
        assert_eq!(status.compliant, Some(true));
        assert_eq!(status.status, SloState::Compliant);
        assert!((status.value.unwrap() - 1000.0 / 1003.0).abs() < EPSILON);
    }

    #[test]
    fn test_availability_violated() {
        let registry = MetricRegistry::default();
        feed(&registry, 1000, 10);

        let status = SloEvaluator::evaluate_at(&availability(), &registry, now()).unwrap();
        assert_eq!(status.compliant, Some(false));
        assert_eq!(status.status, SloState::Violated);
        assert!((status.value.unwrap() - 1000.0 / 1010.0).abs() < EPSILON);
    }

    #[test]
    fn test_ratio_holds_past_per_series_sample_cap() {
        let registry = MetricRegistry::default();
        for i in 0..200_000i64 {
            registry
                .increment_counter_at(&success(), 1.0, seconds_ago(i / 1_000))
                .unwrap();
        }
        for i in 0..1_000i64 {
            registry
                .increment_counter_at(&failure(), 1.0, seconds_ago(i / 5))
                .unwrap();
        }

        let status = SloEvaluator::evaluate_at(&availability(), &registry, now()).unwrap();
        assert!((status.value.unwrap() - 200_000.0 / 201_000.0).abs() < EPSILON);
        assert_eq!(status.status, SloState::Compliant);
    }

    #[test]
    fn test_samples_outside_window_are_ignored() {
        let registry = MetricRegistry::default();
        feed(&registry, 1000, 0);
        for _ in 0..500 {
            registry.increment_counter_at(&failure(), 1.0, seconds_ago(900)).unwrap();
        }

        let status = SloEvaluator::evaluate_at(&availability(), &registry, now()).unwrap();
        assert_eq!(status.value, Some(1.0));
        assert_eq!(status.compliant, Some(true));
    }

    #[test]
    fn test_latency_percentile_from_histogram() {
        let registry = MetricRegistry::new(stagewatch_core::RegistryConfig {
            default_buckets: vec![0.1, 0.2, 0.4, 0.8],
            ..Default::default()
        });
        let latency = MetricId::new("stage_latency_seconds", [("stage", "execution")]).unwrap();
        for (value, n) in [(0.05, 10), (0.15, 20), (0.3, 30), (0.6, 40)] {
            for _ in 0..n {
                registry.observe_histogram_at(&latency, value, seconds_ago(10)).unwrap();
            }
        }

        let slo = SloDefinition::builder()
            .name("execution_p95")
            .percentile(latency, 0.95)
            .at_most(0.8)
            .window(Duration::from_secs(60))
            .build()
            .unwrap();

        let status = SloEvaluator::evaluate_at(&slo, &registry, now()).unwrap();
        assert!((status.value.unwrap() - 0.75).abs() < EPSILON);
        assert_eq!(status.compliant, Some(true));
    }

    #[test]
    fn test_percentile_on_summary_is_exact() {
        let registry = MetricRegistry::default();
        let size = MetricId::unlabeled("batch_size").unwrap();
        for v in 1..=100 {
            registry.observe_summary_at(&size, v as f64, seconds_ago(5)).unwrap();
        }

        let slo = SloDefinition::builder()
            .name("batch_p95")
            .percentile(size, 0.95)
            .at_most(100.0)
            .build()
            .unwrap();
        let status = SloEvaluator::evaluate_at(&slo, &registry, now()).unwrap();
        assert_eq!(status.value, Some(95.0));
    }

    #[test]
    fn test_query_errors() {
        let registry = MetricRegistry::default();
        registry.increment_counter_at(&success(), 1.0, now()).unwrap();

        let unknown = SloDefinition::builder()
            .name("ghost")
            .gauge(MetricId::unlabeled("ghost").unwrap())
            .build()
            .unwrap();
        assert!(matches!(
            SloEvaluator::evaluate_at(&unknown, &registry, now()),
            Err(QueryError::UnknownMetric(_))
        ));

        let wrong_kind = SloDefinition::builder()
            .name("p95_of_counter")
            .percentile(success(), 0.95)
            .at_most(1.0)
            .build()
            .unwrap();
        assert!(matches!(
            SloEvaluator::evaluate_at(&wrong_kind, &registry, now()),
            Err(QueryError::IncompatibleKind { actual: MetricKind::Counter, .. })
        ));

        let out_of_range = SloDefinition {
            name: "p150".into(),
            indicator: SloIndicator::Percentile {
                metric: success().into(),
                percentile: 1.5,
            },
            comparator: Comparator::AtMost,
            threshold: 1.0,
            window: Duration::from_secs(60),
        };
        assert_eq!(
            SloEvaluator::evaluate_at(&out_of_range, &registry, now()),
            Err(QueryError::InvalidPercentile(1.5))
        );
    }

    #[test]
    fn test_bad_definition_does_not_block_others() {
        let registry = MetricRegistry::default();
        feed(&registry, 1000, 3);

        let evaluator = SloEvaluator::new(vec![
            SloDefinition::builder()
                .name("broken")
                .gauge(MetricId::unlabeled("missing").unwrap())
                .build()
                .unwrap(),
            availability(),
        ]);

        let statuses = evaluator.evaluate_all_at(&registry, now());
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].status, SloState::Unknown);
        assert!(statuses[0].error.is_some());
        assert_eq!(statuses[1].status, SloState::Compliant);
    }

    #[test]
    fn test_no_data_and_gauge() {
        let registry = MetricRegistry::default();
        let depth = MetricId::unlabeled("queue_depth").unwrap();
        registry.set_gauge_at(&depth, 3.0, seconds_ago(600)).unwrap();

        let slo = SloDefinition::builder()
            .name("queue")
            .gauge(depth.clone())
            .compare(Comparator::AtMost, 10.0)
            .window(Duration::from_secs(60))
            .build()
            .unwrap();
        let stale = SloEvaluator::evaluate_at(&slo, &registry, now()).unwrap();
        assert_eq!(stale.status, SloState::NoData);
        assert_eq!(stale.compliant, None);

        registry.set_gauge_at(&depth, 12.0, seconds_ago(1)).unwrap();
        let fresh = SloEvaluator::evaluate_at(&slo, &registry, now()).unwrap();
        assert_eq!(fresh.value, Some(12.0));
        assert_eq!(fresh.status, SloState::Violated);
    }
}
