use stagewatch_core::{MetricRegistry, TraceTracker};
use stagewatch_metrics::{Exporter, SloEvaluator};
use std::sync::Arc;

/// Shared handles passed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MetricRegistry>,
    pub tracker: Arc<TraceTracker>,
    pub evaluator: Arc<SloEvaluator>,
    pub exporter: Exporter,
}

impl AppState {
    pub fn new(
        registry: Arc<MetricRegistry>,
        tracker: Arc<TraceTracker>,
        evaluator: Arc<SloEvaluator>,
        exporter: Exporter,
    ) -> Self {
        Self {
            registry,
            tracker,
            evaluator,
            exporter,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.registry.is_ready() && self.tracker.is_ready()
    }
}
