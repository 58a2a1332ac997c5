use crate::instrument::MetricKind;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MetricError {
    #[error("Metric '{name}' is already registered as a {existing}, cannot register as {requested}")]
    Conflict {
        name: String,
        existing: MetricKind,
        requested: MetricKind,
    },

    #[error("Invalid label: {0}")]
    InvalidLabel(String),

    #[error("Invalid metric name: {0}")]
    InvalidName(String),

    #[error("Invalid value for '{name}': {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Metric not found: {0}")]
    NotFound(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceError {
    #[error("Invalid span: {0}")]
    InvalidSpan(String),
}

pub type Result<T> = std::result::Result<T, MetricError>;
