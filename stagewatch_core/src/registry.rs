use crate::error::{MetricError, Result};
use crate::identity::MetricId;
use crate::instrument::{
    exponential_buckets, Instrument, InstrumentOptions, InstrumentSnapshot, MetricKind,
    SeriesWindow,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub default_buckets: Vec<f64>,
    /// Per-metric-name histogram bounds.
    pub bucket_overrides: HashMap<String, Vec<f64>>,
    pub quantiles: Vec<f64>,
    pub max_samples_per_series: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_buckets: exponential_buckets(0.005, 2.0, 12),
            bucket_overrides: HashMap::new(),
            quantiles: vec![0.5, 0.9, 0.99],
            max_samples_per_series: 100_000,
        }
    }
}

#[derive(Debug, Default)]
struct Catalog {
    instruments: HashMap<MetricId, Arc<Instrument>>,
    kinds: HashMap<String, MetricKind>,
    help: HashMap<String, String>,
}

/// Owns every instrument. The catalog lock is only held to look up or
/// create an instrument; updates run under the instrument's own lock.
#[derive(Debug)]
pub struct MetricRegistry {
    catalog: RwLock<Catalog>,
    defaults: InstrumentOptions,
    overrides: HashMap<String, Arc<[f64]>>,
    ready: AtomicBool,
}

impl MetricRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            catalog: RwLock::new(Catalog::default()),
            defaults: InstrumentOptions {
                bounds: Arc::from(config.default_buckets),
                quantiles: Arc::from(config.quantiles),
                max_samples: config.max_samples_per_series,
            },
            overrides: config
                .bucket_overrides
                .into_iter()
                .map(|(name, bounds)| (name, Arc::from(bounds)))
                .collect(),
            ready: AtomicBool::new(false),
        }
    }

    /// Returns the instrument for `id`, creating it on first use.
    ///
    /// Fails with [`MetricError::Conflict`] when the identity, or any other
    /// identity sharing its name, was registered with a different kind.
    pub fn get_or_create(&self, id: &MetricId, kind: MetricKind) -> Result<Arc<Instrument>> {
        {
            let catalog = self.catalog.read();
            if let Some(existing) = catalog.instruments.get(id) {
                return self.check_kind(existing.kind(), id, kind).map(|_| existing.clone());
            }
            if let Some(existing) = catalog.kinds.get(&id.name) {
                self.check_kind(*existing, id, kind)?;
            }
        }

        let mut catalog = self.catalog.write();
        // Another writer may have won the race between the two locks.
        if let Some(existing) = catalog.instruments.get(id) {
            return self.check_kind(existing.kind(), id, kind).map(|_| existing.clone());
        }
        if let Some(existing) = catalog.kinds.get(&id.name) {
            self.check_kind(*existing, id, kind)?;
        }

        let options = self.options_for(&id.name);
        let instrument = Arc::new(Instrument::new(id.clone(), kind, &options));
        catalog.kinds.insert(id.name.clone(), kind);
        catalog.instruments.insert(id.clone(), instrument.clone());
        debug!(metric = %id, kind = %kind, "Registered instrument");

        Ok(instrument)
    }

    pub fn get(&self, id: &MetricId) -> Option<Arc<Instrument>> {
        self.catalog.read().instruments.get(id).cloned()
    }

    /// Attaches help text to a metric name, rendered as `# HELP`.
    pub fn describe(&self, name: impl Into<String>, help: impl Into<String>) {
        self.catalog.write().help.insert(name.into(), help.into());
    }

    pub fn increment_counter(&self, id: &MetricId, delta: f64) -> Result<()> {
        self.increment_counter_at(id, delta, Utc::now())
    }

    pub fn increment_counter_at(&self, id: &MetricId, delta: f64, at: DateTime<Utc>) -> Result<()> {
        self.get_or_create(id, MetricKind::Counter)?.increment(delta, at)
    }

    pub fn set_gauge(&self, id: &MetricId, value: f64) -> Result<()> {
        self.set_gauge_at(id, value, Utc::now())
    }

    pub fn set_gauge_at(&self, id: &MetricId, value: f64, at: DateTime<Utc>) -> Result<()> {
        self.get_or_create(id, MetricKind::Gauge)?.set(value, at)
    }

    pub fn add_gauge(&self, id: &MetricId, delta: f64) -> Result<()> {
        self.add_gauge_at(id, delta, Utc::now())
    }

    pub fn add_gauge_at(&self, id: &MetricId, delta: f64, at: DateTime<Utc>) -> Result<()> {
        self.get_or_create(id, MetricKind::Gauge)?.add(delta, at)
    }

    pub fn observe_histogram(&self, id: &MetricId, value: f64) -> Result<()> {
        self.observe_histogram_at(id, value, Utc::now())
    }

    pub fn observe_histogram_at(&self, id: &MetricId, value: f64, at: DateTime<Utc>) -> Result<()> {
        self.get_or_create(id, MetricKind::Histogram)?.observe(value, at)
    }

    pub fn observe_summary(&self, id: &MetricId, value: f64) -> Result<()> {
        self.observe_summary_at(id, value, Utc::now())
    }

    pub fn observe_summary_at(&self, id: &MetricId, value: f64, at: DateTime<Utc>) -> Result<()> {
        self.get_or_create(id, MetricKind::Summary)?.observe(value, at)
    }

    /// Copies the samples of `id` that fall in `[from, to]`.
    pub fn window(&self, id: &MetricId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<SeriesWindow> {
        let instrument = self
            .get(id)
            .ok_or_else(|| MetricError::NotFound(id.to_string()))?;
        Ok(instrument.window(from, to))
    }

    /// All instruments, in export order. Only the catalog read lock is held,
    /// and only while the handles are cloned.
    pub fn instruments(&self) -> Vec<Arc<Instrument>> {
        let mut instruments: Vec<Arc<Instrument>> =
            self.catalog.read().instruments.values().cloned().collect();
        instruments.sort_by_cached_key(|i| (i.id().name.clone(), i.id().label_string()));
        instruments
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_limited(usize::MAX)
    }

    /// Snapshot of at most `max_series` instruments, the first ones in
    /// export order.
    pub fn snapshot_limited(&self, max_series: usize) -> Snapshot {
        let instruments = self.instruments();
        let help: BTreeMap<String, String> = self
            .catalog
            .read()
            .help
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let total_series = instruments.len();
        let snapshots: Vec<InstrumentSnapshot> = instruments
            .iter()
            .take(max_series)
            .map(|i| i.snapshot())
            .collect();
        let as_of = snapshots.iter().filter_map(|s| s.updated_at).max();

        Snapshot {
            truncated: snapshots.len() < total_series,
            instruments: snapshots,
            help,
            as_of,
            total_series,
        }
    }

    /// Trims every series to `cutoff`. A series whose lock is not available
    /// within `lock_wait` is skipped and reported; the others are still swept.
    pub fn sweep(&self, cutoff: DateTime<Utc>, lock_wait: Duration) -> SweepReport {
        let mut report = SweepReport::default();

        for instrument in self.instruments() {
            report.series += 1;
            match instrument.trim_before(cutoff, lock_wait) {
                Some(evicted) => report.evicted += evicted,
                None => report.skipped.push(instrument.id().clone()),
            }
        }

        report
    }

    pub fn len(&self) -> usize {
        self.catalog.read().instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn options_for(&self, name: &str) -> InstrumentOptions {
        match self.overrides.get(name) {
            Some(bounds) => InstrumentOptions {
                bounds: bounds.clone(),
                ..self.defaults.clone()
            },
            None => self.defaults.clone(),
        }
    }

    fn check_kind(&self, existing: MetricKind, id: &MetricId, requested: MetricKind) -> Result<()> {
        if existing == requested {
            return Ok(());
        }

        warn!(
            metric = %id,
            existing = %existing,
            requested = %requested,
            "Rejected metric update with conflicting kind"
        );
        Err(MetricError::Conflict {
            name: id.name.clone(),
            existing,
            requested,
        })
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

/// Point-in-time copy of the registry, sorted by metric name and then by
/// serialized label set.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub instruments: Vec<InstrumentSnapshot>,
    pub help: BTreeMap<String, String>,
    /// Newest update timestamp across the captured instruments.
    pub as_of: Option<DateTime<Utc>>,
    pub total_series: usize,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub series: usize,
    pub evicted: usize,
    pub skipped: Vec<MetricId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SnapshotValue;
    use chrono::TimeZone;

    fn id(name: &str) -> MetricId {
        MetricId::unlabeled(name).unwrap()
    }

    #[test]
    fn test_conflicting_kind_is_rejected() {
        let registry = MetricRegistry::default();
        let x = id("x");

        registry.increment_counter(&x, 5.0).unwrap();
        let err = registry.set_gauge(&x, 1.0).unwrap_err();
        assert!(matches!(
            err,
            MetricError::Conflict {
                existing: MetricKind::Counter,
                requested: MetricKind::Gauge,
                ..
            }
        ));

        let counter = registry.get(&x).unwrap();
        assert_eq!(counter.kind(), MetricKind::Counter);
        assert_eq!(counter.snapshot().value, SnapshotValue::Counter(5.0));
    }

    #[test]
    fn test_kind_is_fixed_per_name() {
        let registry = MetricRegistry::default();
        let a = MetricId::new("requests", [("stage", "a")]).unwrap();
        let b = MetricId::new("requests", [("stage", "b")]).unwrap();

        registry.increment_counter(&a, 1.0).unwrap();
        assert!(registry.observe_histogram(&b, 1.0).is_err());
        assert!(registry.increment_counter(&b, 1.0).is_ok());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let registry = Arc::new(MetricRegistry::default());
        let counter = MetricId::new("events_total", [("stage", "exec")]).unwrap();
        let writers = 8;
        let increments = 10_000;

        let handles: Vec<_> = (0..writers)
            .map(|_| {
                let registry = registry.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..increments {
                        registry.increment_counter(&counter, 1.0).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.get(&counter).unwrap().snapshot();
        assert_eq!(
            snapshot.value,
            SnapshotValue::Counter((writers * increments) as f64)
        );
    }

    #[test]
    fn test_snapshot_order_and_limit() {
        let registry = MetricRegistry::default();
        registry.set_gauge(&id("zeta"), 1.0).unwrap();
        registry
            .set_gauge(&MetricId::new("alpha", [("k", "b")]).unwrap(), 2.0)
            .unwrap();
        registry
            .set_gauge(&MetricId::new("alpha", [("k", "a")]).unwrap(), 3.0)
            .unwrap();

        let snapshot = registry.snapshot();
        let order: Vec<String> = snapshot.instruments.iter().map(|i| i.id.to_string()).collect();
        assert_eq!(order, vec![r#"alpha{k="a"}"#, r#"alpha{k="b"}"#, "zeta"]);
        assert!(!snapshot.truncated);

        let limited = registry.snapshot_limited(2);
        assert_eq!(limited.instruments.len(), 2);
        assert_eq!(limited.total_series, 3);
        assert!(limited.truncated);
    }

    #[test]
    fn test_histogram_bucket_override() {
        let mut config = RegistryConfig::default();
        config
            .bucket_overrides
            .insert("latency_ms".to_string(), vec![10.0, 100.0]);
        let registry = MetricRegistry::new(config);
        registry.observe_histogram(&id("latency_ms"), 50.0).unwrap();

        match &registry.snapshot().instruments[0].value {
            SnapshotValue::Histogram { buckets, .. } => {
                assert_eq!(buckets.len(), 3);
                assert_eq!(buckets[1].upper_bound, 100.0);
                assert_eq!(buckets[1].cumulative_count, 1);
            }
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    #[test]
    fn test_sweep_trims_each_series() {
        let registry = MetricRegistry::default();
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let g = id("queue_depth");
        for i in 0..10 {
            registry
                .set_gauge_at(&g, i as f64, base + chrono::Duration::seconds(i))
                .unwrap();
        }

        let report = registry.sweep(base + chrono::Duration::seconds(5), Duration::from_millis(10));
        assert_eq!(report.series, 1);
        assert_eq!(report.evicted, 5);
        assert!(report.skipped.is_empty());
        assert_eq!(registry.get(&g).unwrap().sample_count(), 5);
    }

    #[test]
    fn test_window_of_unknown_metric() {
        let registry = MetricRegistry::default();
        let now = Utc::now();
        assert!(matches!(
            registry.window(&id("missing"), now, now),
            Err(MetricError::NotFound(_))
        ));
    }
}
