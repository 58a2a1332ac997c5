use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runs `pass` every `period` until `shutdown` is cancelled.
///
/// Each pass runs on the blocking thread pool, since passes take locks and
/// walk whole collections. Cancellation is only observed between passes, so
/// a pass that has started always runs to completion.
pub fn spawn_periodic<F>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    pass: F,
) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let pass = Arc::new(pass);
    tokio::spawn(async move {
        info!(task = name, period = ?period, "Background task started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let pass = pass.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || pass()).await {
                        warn!(task = name, error = %e, "Background pass panicked");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!(task = name, "Background task received shutdown signal");
                    break;
                }
            }
        }
        info!(task = name, "Background task stopped");
    })
}
