use crate::periodic::spawn_periodic;
use crate::registry::{MetricRegistry, SweepReport};
use crate::series::window_start;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub window: Duration,
    pub period: Duration,
    /// How long to wait for one series' lock before skipping it this pass.
    pub lock_wait: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            period: Duration::from_secs(60),
            lock_wait: Duration::from_millis(50),
        }
    }
}

/// Periodically evicts samples older than the retention window.
pub struct RetentionSweeper {
    registry: Arc<MetricRegistry>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(registry: Arc<MetricRegistry>, config: RetentionConfig) -> Self {
        Self { registry, config }
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = window_start(now, self.config.window);
        let report = self.registry.sweep(cutoff, self.config.lock_wait);

        for id in &report.skipped {
            warn!(metric = %id, "Skipped retention sweep of contended series");
        }
        debug!(
            series = report.series,
            evicted = report.evicted,
            skipped = report.skipped.len(),
            "Retention sweep finished"
        );

        report
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.config.period;
        spawn_periodic("retention-sweeper", period, shutdown, move || {
            self.sweep();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MetricId;
    use chrono::TimeZone;

    #[test]
    fn test_sweep_respects_window_and_keeps_latest() {
        let registry = Arc::new(MetricRegistry::default());
        let now = Utc.timestamp_opt(1_700_010_000, 0).unwrap();
        let hour = chrono::Duration::seconds(3600);

        let fresh = MetricId::unlabeled("fresh_total").unwrap();
        let stale = MetricId::unlabeled("stale_gauge").unwrap();

        registry
            .increment_counter_at(&fresh, 1.0, now - hour - chrono::Duration::seconds(10))
            .unwrap();
        registry
            .increment_counter_at(&fresh, 1.0, now - chrono::Duration::seconds(10))
            .unwrap();
        registry.set_gauge_at(&stale, 4.0, now - hour * 3).unwrap();
        registry.set_gauge_at(&stale, 5.0, now - hour * 2).unwrap();

        let sweeper = RetentionSweeper::new(registry.clone(), RetentionConfig::default());
        let report = sweeper.sweep_at(now);
        assert_eq!(report.series, 2);
        assert_eq!(report.evicted, 2);

        let cutoff = now - hour;
        let fresh_window = registry.window(&fresh, DateTime::<Utc>::MIN_UTC, now).unwrap();
        assert!(fresh_window.samples.iter().all(|s| s.timestamp >= cutoff));
        assert_eq!(fresh_window.samples.len(), 1);

        let stale_window = registry.window(&stale, DateTime::<Utc>::MIN_UTC, now).unwrap();
        assert_eq!(stale_window.samples.len(), 1);
        assert_eq!(stale_window.latest().unwrap().value, 5.0);
    }

    #[test]
    fn test_contended_series_is_skipped_not_fatal() {
        let registry = Arc::new(MetricRegistry::default());
        let now = Utc::now();
        let a = MetricId::unlabeled("a").unwrap();
        let b = MetricId::unlabeled("b").unwrap();
        registry.set_gauge_at(&a, 1.0, now - chrono::Duration::hours(3)).unwrap();
        registry.set_gauge_at(&a, 2.0, now).unwrap();
        registry.set_gauge_at(&b, 1.0, now - chrono::Duration::hours(3)).unwrap();
        registry.set_gauge_at(&b, 2.0, now).unwrap();

        let config = RetentionConfig {
            lock_wait: Duration::from_millis(1),
            ..RetentionConfig::default()
        };
        let sweeper = RetentionSweeper::new(registry.clone(), config);

        let held = registry.get(&a).unwrap();
        let report = held.hold_lock_for_test(|| sweeper.sweep_at(now));

        assert_eq!(report.skipped, vec![a.clone()]);
        assert_eq!(report.evicted, 1);
        assert_eq!(registry.get(&b).unwrap().sample_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_shutdown() {
        let registry = Arc::new(MetricRegistry::default());
        let token = CancellationToken::new();
        let handle = RetentionSweeper::new(registry, RetentionConfig::default()).start(token.clone());

        tokio::time::sleep(Duration::from_secs(125)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
