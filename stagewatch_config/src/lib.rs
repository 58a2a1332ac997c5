pub mod config;
pub mod parser;
pub mod slo;

pub use config::{
    ConfigError, HistogramSettings, PipelineSettings, RetentionSettings, ServerConfig,
    StagewatchConfig, SummarySettings, DEFAULT_PORT,
};
pub use parser::{parse_config_from_file, parse_config_from_str};
pub use slo::{Comparator, MetricRef, SloDefinition, SloIndicator};
