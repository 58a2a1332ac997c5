pub mod exporters;
pub mod slo;

pub use exporters::{Exporter, JsonExporter, MetricsDocument, PrometheusExporter};
pub use slo::{interpolate_percentile, QueryError, SloEvaluator, SloState, SloStatus, SloWindow};
