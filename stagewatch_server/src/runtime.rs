use crate::routes::router;
use crate::state::AppState;
use anyhow::{Context, Result};
use axum::Router;
use stagewatch_config::{SloIndicator, StagewatchConfig};
use stagewatch_core::{
    MetricKind, MetricRegistry, RetentionSweeper, TimeoutScanner, TraceTracker,
};
use stagewatch_metrics::{Exporter, SloEvaluator};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Serves `app` on `listener` until `shutdown` is cancelled, then stops
/// accepting and lets in-flight requests finish.
pub async fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Owns every component and background task of a running instance.
pub struct Runtime {
    state: AppState,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    server: JoinHandle<std::io::Result<()>>,
    local_addr: SocketAddr,
    drain_timeout: Duration,
}

impl Runtime {
    /// Builds the registry, tracker and evaluator from `config`, starts the
    /// retention sweeper and timeout scanner, and serves HTTP on `listener`.
    pub fn start(config: StagewatchConfig, listener: TcpListener) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let local_addr = listener.local_addr().context("Listener has no local address")?;

        let registry = Arc::new(MetricRegistry::new(config.registry_config()));
        let tracker = Arc::new(TraceTracker::new(config.trace_config()));
        preregister_ratio_counters(&registry, &config);

        let evaluator = Arc::new(SloEvaluator::new(config.slos.clone()));
        let exporter = Exporter::new(config.server.max_series_per_response);
        let state = AppState::new(registry.clone(), tracker.clone(), evaluator, exporter);

        let shutdown = CancellationToken::new();
        let tasks = vec![
            RetentionSweeper::new(registry.clone(), config.retention_config()).start(shutdown.clone()),
            TimeoutScanner::new(tracker.clone()).start(shutdown.clone()),
        ];

        registry.mark_ready();
        tracker.mark_ready();

        let server = tokio::spawn(serve(listener, router(state.clone()), shutdown.clone()));
        info!(
            addr = %local_addr,
            slos = config.slos.len(),
            stages = config.pipeline.stages.len(),
            "Stagewatch listening"
        );

        Ok(Self {
            state,
            shutdown,
            tasks,
            server,
            local_addr,
            drain_timeout: config.server.drain_timeout,
        })
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.state.registry
    }

    pub fn tracker(&self) -> &Arc<TraceTracker> {
        &self.state.tracker
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels the background tasks, waits for any pass in progress, then
    /// drains HTTP for at most the configured drain timeout.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down");
        self.shutdown.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        drain(self.server, self.drain_timeout).await?;
        Ok(())
    }
}

/// Waits up to `timeout` for a server whose shutdown token is already
/// cancelled, then aborts it. Returns whether every connection finished.
async fn drain(mut server: JoinHandle<std::io::Result<()>>, timeout: Duration) -> Result<bool> {
    match tokio::time::timeout(timeout, &mut server).await {
        Ok(joined) => {
            joined.context("HTTP server task panicked")?.context("HTTP server failed")?;
            info!("HTTP server drained");
            Ok(true)
        }
        Err(_) => {
            warn!(timeout = ?timeout, "Drain timeout expired, dropping open connections");
            server.abort();
            Ok(false)
        }
    }
}

/// Creates both counters of every ratio SLO so that a failure counter that
/// has never been incremented reads as zero instead of unknown.
fn preregister_ratio_counters(registry: &MetricRegistry, config: &StagewatchConfig) {
    for slo in &config.slos {
        if let SloIndicator::Ratio { .. } = slo.indicator {
            for metric in slo.indicator.metrics() {
                if let Err(e) = registry.get_or_create(metric.id(), MetricKind::Counter) {
                    warn!(slo = %slo.name, metric = %metric, error = %e, "Cannot pre-register SLO counter");
                }
            }
        }
    }
}
