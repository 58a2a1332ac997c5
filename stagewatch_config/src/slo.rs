use serde::{Deserialize, Serialize};
use stagewatch_core::{MetricError, MetricId};
use std::fmt;
use std::time::Duration;

const EQUALITY_EPSILON: f64 = 1e-9;

/// A metric identity written in selector syntax, e.g.
/// `requests_total{outcome="success"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricRef(MetricId);

impl MetricRef {
    pub fn id(&self) -> &MetricId {
        &self.0
    }
}

impl From<MetricId> for MetricRef {
    fn from(id: MetricId) -> Self {
        Self(id)
    }
}

impl TryFrom<String> for MetricRef {
    type Error = MetricError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse().map(Self)
    }
}

impl From<MetricRef> for String {
    fn from(value: MetricRef) -> Self {
        value.0.to_string()
    }
}

impl fmt::Display for MetricRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">=", alias = "≥")]
    AtLeast,
    #[serde(rename = "<=", alias = "≤")]
    AtMost,
    #[serde(rename = "==", alias = "=")]
    Equal,
}

impl Comparator {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::AtLeast => value >= threshold,
            Comparator::AtMost => value <= threshold,
            Comparator::Equal => (value - threshold).abs() <= EQUALITY_EPSILON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Comparator::AtLeast => ">=",
            Comparator::AtMost => "<=",
            Comparator::Equal => "==",
        }
    }
}

/// How the value compared against the threshold is derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SloIndicator {
    /// good / (good + bad), both counters, counted inside the window.
    Ratio { good: MetricRef, bad: MetricRef },
    /// Percentile in `(0, 1]` of a histogram or summary inside the window.
    Percentile { metric: MetricRef, percentile: f64 },
    /// Latest gauge value inside the window.
    Gauge { metric: MetricRef },
}

impl SloIndicator {
    pub fn metrics(&self) -> Vec<&MetricRef> {
        match self {
            SloIndicator::Ratio { good, bad } => vec![good, bad],
            SloIndicator::Percentile { metric, .. } | SloIndicator::Gauge { metric } => vec![metric],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SloDefinition {
    pub name: String,
    pub indicator: SloIndicator,
    pub comparator: Comparator,
    pub threshold: f64,
    /// `"5m"`-style text or whole seconds; also read from `windowSeconds`.
    #[serde(with = "crate::config::humantime_serde", alias = "windowSeconds")]
    pub window: Duration,
}

impl SloDefinition {
    pub fn builder() -> SloDefinitionBuilder {
        SloDefinitionBuilder::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("SLO name cannot be empty".to_string());
        }
        if !self.threshold.is_finite() {
            return Err(format!("SLO '{}' threshold must be finite", self.name));
        }
        if self.window.is_zero() {
            return Err(format!("SLO '{}' window must be > 0", self.name));
        }
        if let SloIndicator::Percentile { percentile, .. } = &self.indicator {
            if !(*percentile > 0.0 && *percentile <= 1.0) {
                return Err(format!(
                    "SLO '{}' percentile must be in (0, 1], got {}",
                    self.name, percentile
                ));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct SloDefinitionBuilder {
    name: Option<String>,
    indicator: Option<SloIndicator>,
    comparator: Option<Comparator>,
    threshold: f64,
    window: Option<Duration>,
}

impl SloDefinitionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn ratio(mut self, good: MetricId, bad: MetricId) -> Self {
        self.indicator = Some(SloIndicator::Ratio {
            good: good.into(),
            bad: bad.into(),
        });
        self
    }

    pub fn percentile(mut self, metric: MetricId, percentile: f64) -> Self {
        self.indicator = Some(SloIndicator::Percentile {
            metric: metric.into(),
            percentile,
        });
        self
    }

    pub fn gauge(mut self, metric: MetricId) -> Self {
        self.indicator = Some(SloIndicator::Gauge {
            metric: metric.into(),
        });
        self
    }

    pub fn at_least(self, threshold: f64) -> Self {
        self.compare(Comparator::AtLeast, threshold)
    }

    pub fn at_most(self, threshold: f64) -> Self {
        self.compare(Comparator::AtMost, threshold)
    }

    pub fn compare(mut self, comparator: Comparator, threshold: f64) -> Self {
        self.comparator = Some(comparator);
        self.threshold = threshold;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn build(self) -> Result<SloDefinition, String> {
        let name = self.name.unwrap_or_else(|| "unnamed".to_string());
        let indicator = self
            .indicator
            .ok_or_else(|| format!("SLO '{}' has no indicator", name))?;

        let definition = SloDefinition {
            name,
            indicator,
            comparator: self.comparator.unwrap_or(Comparator::AtLeast),
            threshold: self.threshold,
            window: self.window.unwrap_or(Duration::from_secs(300)),
        };
        definition.validate()?;
        Ok(definition)
    }
}
