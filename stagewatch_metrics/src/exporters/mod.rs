pub mod json;
pub mod prometheus;

pub use json::{JsonExporter, MetricsDocument};
pub use prometheus::PrometheusExporter;

use stagewatch_core::{MetricRegistry, Snapshot};

/// Takes series-capped snapshots and hands them to the renderers.
#[derive(Debug, Clone, Copy)]
pub struct Exporter {
    max_series: usize,
}

impl Exporter {
    pub fn new(max_series: usize) -> Self {
        Self {
            max_series: max_series.max(1),
        }
    }

    pub fn max_series(&self) -> usize {
        self.max_series
    }

    pub fn snapshot(&self, registry: &MetricRegistry) -> Snapshot {
        registry.snapshot_limited(self.max_series)
    }

    pub fn render_text(&self, snapshot: &Snapshot) -> String {
        PrometheusExporter::format(snapshot)
    }

    pub fn render_json(&self, snapshot: &Snapshot) -> anyhow::Result<String> {
        JsonExporter::to_string(snapshot)
    }
}

impl Default for Exporter {
    fn default() -> Self {
        Self::new(10_000)
    }
}
