use crate::error::TraceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// One stage's timed participation in processing a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub stage: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: SpanStatus,
}

impl Span {
    pub fn new(
        trace_id: impl Into<String>,
        stage: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: SpanStatus,
    ) -> Self {
        Self {
            trace_id: trace_id.into(),
            stage: stage.into(),
            start,
            end,
            status,
        }
    }

    pub fn validate(&self) -> Result<(), TraceError> {
        if self.trace_id.trim().is_empty() {
            return Err(TraceError::InvalidSpan("trace id cannot be empty".to_string()));
        }
        if self.stage.trim().is_empty() {
            return Err(TraceError::InvalidSpan(format!(
                "stage name cannot be empty (trace '{}')",
                self.trace_id
            )));
        }
        if self.end < self.start {
            return Err(TraceError::InvalidSpan(format!(
                "span '{}' of trace '{}' ends before it starts",
                self.stage, self.trace_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceState {
    Open,
    Complete,
    Incomplete,
}

impl TraceState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TraceState::Open)
    }
}

#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub trace_id: String,
    /// Ordered by span start timestamp, not arrival.
    pub spans: Vec<Span>,
    pub state: TraceState,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TraceRecord {
    pub fn new(trace_id: impl Into<String>, opened_at: DateTime<Utc>) -> Self {
        Self {
            trace_id: trace_id.into(),
            spans: Vec::new(),
            state: TraceState::Open,
            opened_at,
            closed_at: None,
        }
    }

    pub fn span(&self, stage: &str) -> Option<&Span> {
        self.spans.iter().find(|s| s.stage == stage)
    }

    pub fn insert(&mut self, span: Span) {
        let index = self.spans.partition_point(|s| s.start <= span.start);
        self.spans.insert(index, span);
    }

    pub fn missing_stages(&self, stages: &[String]) -> Vec<String> {
        stages
            .iter()
            .filter(|stage| self.span(stage).is_none())
            .cloned()
            .collect()
    }

    pub fn extraneous_stages(&self, stages: &[String]) -> Vec<String> {
        self.spans
            .iter()
            .filter(|s| !stages.contains(&s.stage))
            .map(|s| s.stage.clone())
            .collect()
    }

    /// End of the last declared stage minus start of the first one.
    pub fn latency_ms(&self, stages: &[String]) -> Option<f64> {
        let first = self.span(stages.first()?)?;
        let last = self.span(stages.last()?)?;
        let millis = (last.end - first.start).num_microseconds()? as f64 / 1000.0;
        Some(millis)
    }

    pub fn view(&self, stages: &[String]) -> TraceView {
        TraceView {
            trace_id: self.trace_id.clone(),
            state: self.state,
            spans: self.spans.clone(),
            missing_stages: self.missing_stages(stages),
            extraneous_stages: self.extraneous_stages(stages),
            failed_stages: self
                .spans
                .iter()
                .filter(|s| s.status == SpanStatus::Error)
                .map(|s| s.stage.clone())
                .collect(),
            latency_ms: match self.state {
                TraceState::Complete => self.latency_ms(stages),
                _ => None,
            },
            opened_at: self.opened_at,
            closed_at: self.closed_at,
        }
    }
}

/// Read-only copy of a trace record as returned by queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceView {
    pub trace_id: String,
    pub state: TraceState,
    pub spans: Vec<Span>,
    pub missing_stages: Vec<String>,
    pub extraneous_stages: Vec<String>,
    pub failed_stages: Vec<String>,
    pub latency_ms: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}
