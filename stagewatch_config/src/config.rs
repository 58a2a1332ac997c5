use crate::slo::SloDefinition;
use serde::{Deserialize, Serialize};
use stagewatch_core::instrument::validate_bounds;
use stagewatch_core::{exponential_buckets, RegistryConfig, RetentionConfig, TraceConfig};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 9090;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagewatchConfig {
    pub server: ServerConfig,
    pub retention: RetentionSettings,
    pub histogram: HistogramSettings,
    pub summary: SummarySettings,
    pub pipeline: PipelineSettings,
    pub slos: Vec<SloDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    pub max_series_per_response: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            drain_timeout: Duration::from_secs(10),
            max_series_per_response: 10_000,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_period: Duration,
    #[serde(with = "humantime_serde")]
    pub lock_wait: Duration,
    pub max_samples_per_series: usize,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        let defaults = RetentionConfig::default();
        Self {
            window: defaults.window,
            sweep_period: defaults.period,
            lock_wait: defaults.lock_wait,
            max_samples_per_series: RegistryConfig::default().max_samples_per_series,
        }
    }
}

/// Exponential bucket layout plus optional per-metric bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistogramSettings {
    pub start: f64,
    pub factor: f64,
    pub count: usize,
    pub overrides: HashMap<String, Vec<f64>>,
}

impl Default for HistogramSettings {
    fn default() -> Self {
        Self {
            start: 0.005,
            factor: 2.0,
            count: 12,
            overrides: HashMap::new(),
        }
    }
}

impl HistogramSettings {
    pub fn bounds(&self) -> Vec<f64> {
        exponential_buckets(self.start, self.factor, self.count)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarySettings {
    pub quantiles: Vec<f64>,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            quantiles: RegistryConfig::default().quantiles,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub stages: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub completion_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    #[serde(with = "humantime_serde")]
    pub scan_period: Duration,
    #[serde(with = "humantime_serde")]
    pub continuity_window: Duration,
    pub max_outcomes: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        let defaults = TraceConfig::default();
        Self {
            stages: defaults.stages,
            completion_timeout: defaults.completion_timeout,
            grace_period: defaults.grace_period,
            scan_period: defaults.scan_period,
            continuity_window: defaults.continuity_window,
            max_outcomes: defaults.max_outcomes,
        }
    }
}

impl StagewatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| -> Result<(), ConfigError> { Err(ConfigError::Invalid(msg)) };

        if self.server.max_series_per_response == 0 {
            return invalid("server.max_series_per_response must be > 0".to_string());
        }

        let retention = &self.retention;
        if retention.window.is_zero() || retention.sweep_period.is_zero() {
            return invalid("retention window and sweep period must be > 0".to_string());
        }
        // Series hold one entry per second, so the cap must span the window.
        let slots = retention.window.as_secs().saturating_add(1);
        if (retention.max_samples_per_series as u64) < slots {
            return invalid(format!(
                "retention.max_samples_per_series ({}) must cover the {} one-second slots of the retention window",
                retention.max_samples_per_series, slots
            ));
        }

        let histogram = &self.histogram;
        if !(histogram.start > 0.0) || !(histogram.factor > 1.0) || histogram.count == 0 {
            return invalid(format!(
                "histogram buckets need start > 0, factor > 1 and count > 0 (got {}, {}, {})",
                histogram.start, histogram.factor, histogram.count
            ));
        }
        validate_bounds(&histogram.bounds()).map_err(ConfigError::Invalid)?;
        for (name, bounds) in &histogram.overrides {
            validate_bounds(bounds)
                .map_err(|e| ConfigError::Invalid(format!("histogram override '{}': {}", name, e)))?;
        }

        for q in &self.summary.quantiles {
            if !(*q > 0.0 && *q < 1.0) {
                return invalid(format!("summary quantile {} must be in (0, 1)", q));
            }
        }

        let pipeline = &self.pipeline;
        if pipeline.stages.is_empty() {
            return invalid("pipeline must declare at least one stage".to_string());
        }
        let mut seen = HashSet::new();
        for stage in &pipeline.stages {
            if stage.trim().is_empty() {
                return invalid("pipeline stage names cannot be empty".to_string());
            }
            if !seen.insert(stage.as_str()) {
                return invalid(format!("pipeline stage '{}' is declared twice", stage));
            }
        }
        if pipeline.completion_timeout.is_zero()
            || pipeline.scan_period.is_zero()
            || pipeline.continuity_window.is_zero()
        {
            return invalid("pipeline timeout, scan period and continuity window must be > 0".to_string());
        }

        let mut names = HashSet::new();
        for slo in &self.slos {
            slo.validate().map_err(ConfigError::Invalid)?;
            if !names.insert(slo.name.as_str()) {
                return invalid(format!("SLO '{}' is defined twice", slo.name));
            }
        }

        Ok(())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            default_buckets: self.histogram.bounds(),
            bucket_overrides: self.histogram.overrides.clone(),
            quantiles: self.summary.quantiles.clone(),
            max_samples_per_series: self.retention.max_samples_per_series,
        }
    }

    pub fn retention_config(&self) -> RetentionConfig {
        RetentionConfig {
            window: self.retention.window,
            period: self.retention.sweep_period,
            lock_wait: self.retention.lock_wait,
        }
    }

    pub fn trace_config(&self) -> TraceConfig {
        TraceConfig {
            stages: self.pipeline.stages.clone(),
            completion_timeout: self.pipeline.completion_timeout,
            grace_period: self.pipeline.grace_period,
            continuity_window: self.pipeline.continuity_window,
            scan_period: self.pipeline.scan_period,
            max_outcomes: self.pipeline.max_outcomes,
        }
    }
}

pub(crate) mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    /// Either a humantime string (`"5m"`) or a whole number of seconds.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
            RawDuration::Text(s) => humantime::parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }
}
