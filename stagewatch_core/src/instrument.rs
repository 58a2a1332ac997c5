use crate::error::{MetricError, Result};
use crate::identity::MetricId;
use crate::series::{BucketSeries, Sample, TimeSeries};
use crate::stats;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `count` upper bounds starting at `start`, each `factor` times the previous.
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    let mut bounds = Vec::with_capacity(count);
    let mut bound = start;
    for _ in 0..count {
        bounds.push(bound);
        bound *= factor;
    }
    bounds
}

pub fn validate_bounds(bounds: &[f64]) -> std::result::Result<(), String> {
    if bounds.is_empty() {
        return Err("bucket bounds cannot be empty".to_string());
    }
    if bounds.iter().any(|b| !b.is_finite()) {
        return Err("bucket bounds must be finite".to_string());
    }
    if bounds.windows(2).any(|w| w[0] >= w[1]) {
        return Err("bucket bounds must be strictly increasing".to_string());
    }
    Ok(())
}

#[derive(Debug)]
enum Aggregate {
    Counter {
        total: f64,
    },
    Gauge {
        value: f64,
    },
    Histogram {
        bounds: Arc<[f64]>,
        // One slot per bound plus the implicit +Inf bucket; not cumulative.
        counts: Vec<u64>,
        sum: f64,
        count: u64,
        recent: BucketSeries,
    },
    Summary {
        quantiles: Arc<[f64]>,
        sum: f64,
        count: u64,
    },
}

/// `series` holds one sample per second of counter deltas, gauge values or
/// histogram sums. Summaries keep every observation for exact quantiles.
#[derive(Debug)]
struct InstrumentState {
    aggregate: Aggregate,
    series: TimeSeries,
    updated_at: Option<DateTime<Utc>>,
}

/// A single named, labeled statistic. All mutation goes through the
/// instrument's own lock, so updates to one instrument are linearized while
/// different instruments never contend.
#[derive(Debug)]
pub struct Instrument {
    id: MetricId,
    kind: MetricKind,
    state: Mutex<InstrumentState>,
}

/// Kind-specific settings needed when an instrument is first created.
#[derive(Debug, Clone)]
pub struct InstrumentOptions {
    pub bounds: Arc<[f64]>,
    pub quantiles: Arc<[f64]>,
    pub max_samples: usize,
}

impl Instrument {
    pub fn new(id: MetricId, kind: MetricKind, options: &InstrumentOptions) -> Self {
        let aggregate = match kind {
            MetricKind::Counter => Aggregate::Counter { total: 0.0 },
            MetricKind::Gauge => Aggregate::Gauge { value: 0.0 },
            MetricKind::Histogram => Aggregate::Histogram {
                bounds: options.bounds.clone(),
                counts: vec![0; options.bounds.len() + 1],
                sum: 0.0,
                count: 0,
                recent: BucketSeries::new(options.bounds.len() + 1, options.max_samples),
            },
            MetricKind::Summary => Aggregate::Summary {
                quantiles: options.quantiles.clone(),
                sum: 0.0,
                count: 0,
            },
        };

        Self {
            id,
            kind,
            state: Mutex::new(InstrumentState {
                aggregate,
                series: TimeSeries::with_capacity(options.max_samples),
                updated_at: None,
            }),
        }
    }

    pub fn id(&self) -> &MetricId {
        &self.id
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn increment(&self, delta: f64, timestamp: DateTime<Utc>) -> Result<()> {
        if !delta.is_finite() || delta < 0.0 {
            return Err(self.invalid_value(format!("counter delta must be >= 0, got {}", delta)));
        }

        let mut state = self.state.lock();
        match &mut state.aggregate {
            Aggregate::Counter { total } => *total += delta,
            _ => return Err(self.mismatch(MetricKind::Counter)),
        }
        state.touch(timestamp);
        state.series.accumulate(Sample::new(timestamp, delta));
        Ok(())
    }

    pub fn set(&self, value: f64, timestamp: DateTime<Utc>) -> Result<()> {
        self.check_finite(value)?;

        let mut state = self.state.lock();
        match &mut state.aggregate {
            Aggregate::Gauge { value: current } => *current = value,
            _ => return Err(self.mismatch(MetricKind::Gauge)),
        }
        state.touch(timestamp);
        state.series.replace(Sample::new(timestamp, value));
        Ok(())
    }

    pub fn add(&self, delta: f64, timestamp: DateTime<Utc>) -> Result<()> {
        self.check_finite(delta)?;

        let mut state = self.state.lock();
        let value = match &mut state.aggregate {
            Aggregate::Gauge { value } => {
                *value += delta;
                *value
            }
            _ => return Err(self.mismatch(MetricKind::Gauge)),
        };
        state.touch(timestamp);
        state.series.replace(Sample::new(timestamp, value));
        Ok(())
    }

    pub fn observe(&self, value: f64, timestamp: DateTime<Utc>) -> Result<()> {
        self.check_finite(value)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match &mut state.aggregate {
            Aggregate::Histogram {
                bounds,
                counts,
                sum,
                count,
                recent,
            } => {
                let index = bounds.partition_point(|b| *b < value);
                counts[index] += 1;
                *sum += value;
                *count += 1;
                recent.record(timestamp, index);
                state.series.accumulate(Sample::new(timestamp, value));
            }
            Aggregate::Summary { sum, count, .. } => {
                *sum += value;
                *count += 1;
                state.series.push(Sample::new(timestamp, value));
            }
            _ => return Err(self.mismatch(MetricKind::Histogram)),
        }
        state.touch(timestamp);
        Ok(())
    }

    /// Point-in-time copy of the accumulated values. Summary quantiles are
    /// computed after the lock is released.
    pub fn snapshot(&self) -> InstrumentSnapshot {
        let (mut value, updated_at, mut observations) = {
            let state = self.state.lock();
            let value = match &state.aggregate {
                Aggregate::Counter { total } => SnapshotValue::Counter(*total),
                Aggregate::Gauge { value } => SnapshotValue::Gauge(*value),
                Aggregate::Histogram {
                    bounds,
                    counts,
                    sum,
                    count,
                    ..
                } => {
                    let mut cumulative = 0;
                    let buckets = counts
                        .iter()
                        .enumerate()
                        .map(|(i, c)| {
                            cumulative += c;
                            BucketCount {
                                upper_bound: bounds.get(i).copied().unwrap_or(f64::INFINITY),
                                cumulative_count: cumulative,
                            }
                        })
                        .collect();
                    SnapshotValue::Histogram {
                        buckets,
                        sum: *sum,
                        count: *count,
                    }
                }
                Aggregate::Summary {
                    quantiles,
                    sum,
                    count,
                } => SnapshotValue::Summary {
                    quantiles: quantiles
                        .iter()
                        .map(|q| QuantileValue {
                            quantile: *q,
                            value: None,
                        })
                        .collect(),
                    sum: *sum,
                    count: *count,
                },
            };

            let observations: Vec<f64> = match self.kind {
                MetricKind::Summary => state.series.iter().map(|s| s.value).collect(),
                _ => Vec::new(),
            };
            (value, state.updated_at, observations)
        };

        if let SnapshotValue::Summary { quantiles, .. } = &mut value {
            stats::sort_values(&mut observations);
            for q in quantiles.iter_mut() {
                q.value = stats::percentile(&observations, q.quantile);
            }
        }

        InstrumentSnapshot {
            id: self.id.clone(),
            kind: self.kind,
            value,
            updated_at,
        }
    }

    /// Copies the samples recorded in `[from, to]`, and for histograms the
    /// per-bucket counts of the same window.
    pub fn window(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> SeriesWindow {
        let state = self.state.lock();
        let (bounds, counts) = match &state.aggregate {
            Aggregate::Histogram { bounds, recent, .. } => {
                (Some(bounds.clone()), Some(recent.window_counts(from, to)))
            }
            _ => (None, None),
        };

        SeriesWindow {
            id: self.id.clone(),
            kind: self.kind,
            samples: state.series.window(from, to).copied().collect(),
            bounds,
            counts,
        }
    }

    /// Trims samples older than `cutoff`. Gives up and returns `None` if the
    /// lock cannot be taken within `wait`.
    pub fn trim_before(&self, cutoff: DateTime<Utc>, wait: Duration) -> Option<usize> {
        let mut guard = self.state.try_lock_for(wait)?;
        let state = &mut *guard;
        if let Aggregate::Histogram { recent, .. } = &mut state.aggregate {
            recent.trim_before(cutoff);
        }
        Some(state.series.trim_before(cutoff))
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().series.len()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().updated_at
    }

    #[cfg(test)]
    pub(crate) fn hold_lock_for_test<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.state.lock();
        f()
    }

    fn check_finite(&self, value: f64) -> Result<()> {
        if value.is_finite() {
            Ok(())
        } else {
            Err(self.invalid_value(format!("value must be finite, got {}", value)))
        }
    }

    fn mismatch(&self, requested: MetricKind) -> MetricError {
        MetricError::Conflict {
            name: self.id.name.clone(),
            existing: self.kind,
            requested,
        }
    }

    fn invalid_value(&self, reason: String) -> MetricError {
        MetricError::InvalidValue {
            name: self.id.name.clone(),
            reason,
        }
    }
}

impl InstrumentState {
    fn touch(&mut self, timestamp: DateTime<Utc>) {
        self.updated_at = Some(match self.updated_at {
            Some(prev) if prev > timestamp => prev,
            _ => timestamp,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketCount {
    /// `f64::INFINITY` for the overflow bucket.
    pub upper_bound: f64,
    pub cumulative_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuantileValue {
    pub quantile: f64,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotValue {
    Counter(f64),
    Gauge(f64),
    Histogram {
        buckets: Vec<BucketCount>,
        sum: f64,
        count: u64,
    },
    Summary {
        quantiles: Vec<QuantileValue>,
        sum: f64,
        count: u64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSnapshot {
    pub id: MetricId,
    pub kind: MetricKind,
    pub value: SnapshotValue,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Samples of one instrument restricted to a time window.
#[derive(Debug, Clone)]
pub struct SeriesWindow {
    pub id: MetricId,
    pub kind: MetricKind,
    pub samples: Vec<Sample>,
    /// Bucket bounds, for histograms only.
    pub bounds: Option<Arc<[f64]>>,
    /// Non-cumulative in-window bucket counts, `+Inf` last. Histograms only.
    pub counts: Option<Vec<u64>>,
}

impl SeriesWindow {
    pub fn sum(&self) -> f64 {
        self.samples.iter().map(|s| s.value).sum()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn bucket_counts(&self) -> Option<&[u64]> {
        self.counts.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> InstrumentOptions {
        InstrumentOptions {
            bounds: Arc::from(vec![1.0, 2.0, 4.0]),
            quantiles: Arc::from(vec![0.5, 0.9]),
            max_samples: 1024,
        }
    }

    fn instrument(kind: MetricKind) -> Instrument {
        Instrument::new(MetricId::unlabeled("m").unwrap(), kind, &options())
    }

    #[test]
    fn test_counter_rejects_negative_delta() {
        let counter = instrument(MetricKind::Counter);
        assert!(counter.increment(2.0, Utc::now()).is_ok());
        assert!(matches!(
            counter.increment(-1.0, Utc::now()),
            Err(MetricError::InvalidValue { .. })
        ));
        assert_eq!(counter.snapshot().value, SnapshotValue::Counter(2.0));
    }

    #[test]
    fn test_kind_mismatch_is_conflict() {
        let gauge = instrument(MetricKind::Gauge);
        assert!(matches!(
            gauge.increment(1.0, Utc::now()),
            Err(MetricError::Conflict { existing: MetricKind::Gauge, .. })
        ));
    }

    #[test]
    fn test_gauge_add_and_set() {
        let gauge = instrument(MetricKind::Gauge);
        gauge.set(10.0, Utc::now()).unwrap();
        gauge.add(-3.0, Utc::now()).unwrap();
        assert_eq!(gauge.snapshot().value, SnapshotValue::Gauge(7.0));
        assert!(gauge.set(f64::NAN, Utc::now()).is_err());
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = instrument(MetricKind::Histogram);
        for v in [0.5, 1.0, 1.5, 3.0, 10.0] {
            histogram.observe(v, Utc::now()).unwrap();
        }

        match histogram.snapshot().value {
            SnapshotValue::Histogram { buckets, sum, count } => {
                let cumulative: Vec<u64> = buckets.iter().map(|b| b.cumulative_count).collect();
                assert_eq!(cumulative, vec![2, 3, 4, 5]);
                assert!(buckets[3].upper_bound.is_infinite());
                assert_eq!(count, 5);
                assert_eq!(sum, 16.0);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    #[test]
    fn test_summary_quantiles() {
        let summary = instrument(MetricKind::Summary);
        for v in 1..=10 {
            summary.observe(v as f64, Utc::now()).unwrap();
        }

        match summary.snapshot().value {
            SnapshotValue::Summary { quantiles, count, .. } => {
                assert_eq!(count, 10);
                assert_eq!(quantiles[0].value, Some(5.0));
                assert_eq!(quantiles[1].value, Some(9.0));
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_counter_window_survives_more_increments_than_capacity() {
        let counter = Instrument::new(
            MetricId::unlabeled("requests_total").unwrap(),
            MetricKind::Counter,
            &InstrumentOptions {
                max_samples: 10,
                ..options()
            },
        );
        for i in 0..5_000 {
            counter.increment(1.0, at(i / 1_000)).unwrap();
        }

        assert_eq!(counter.sample_count(), 5);
        assert_eq!(counter.window(at(0), at(4)).sum(), 5_000.0);
    }

    #[test]
    fn test_histogram_window_counts_survive_capacity() {
        let histogram = Instrument::new(
            MetricId::unlabeled("latency_seconds").unwrap(),
            MetricKind::Histogram,
            &InstrumentOptions {
                max_samples: 4,
                ..options()
            },
        );
        for i in 0..400 {
            let value = if i % 4 == 0 { 3.0 } else { 0.5 };
            histogram.observe(value, at(i / 100)).unwrap();
        }

        let window = histogram.window(at(0), at(3));
        assert_eq!(window.bucket_counts(), Some(&[300, 0, 100, 0][..]));
        assert_eq!(window.sum(), 450.0);

        assert_eq!(histogram.trim_before(at(2), Duration::from_millis(10)), Some(2));
        assert_eq!(histogram.window(at(0), at(3)).bucket_counts(), Some(&[150, 0, 50, 0][..]));
    }

    #[test]
    fn test_gauge_keeps_last_value_per_second() {
        let gauge = instrument(MetricKind::Gauge);
        gauge.set(1.0, at(0)).unwrap();
        gauge.set(5.0, at(0)).unwrap();
        gauge.add(2.0, at(1)).unwrap();

        let window = gauge.window(at(0), at(1));
        let values: Vec<f64> = window.samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![5.0, 7.0]);
    }

    #[test]
    fn test_exponential_buckets() {
        assert_eq!(exponential_buckets(1.0, 2.0, 4), vec![1.0, 2.0, 4.0, 8.0]);
        assert!(validate_bounds(&[1.0, 1.0]).is_err());
        assert!(validate_bounds(&[]).is_err());
        assert!(validate_bounds(&[0.1, 0.2]).is_ok());
    }
}
