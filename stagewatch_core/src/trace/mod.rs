//! Cross-stage trace continuity.
//!
//! Every trace moves through `Open -> Complete` (all declared stages
//! reported) or `Open -> Incomplete` (completion timeout elapsed first).
//! Terminal records stay queryable for a grace period and are then evicted;
//! their outcome survives in a bounded history used by continuity reports.
//! Evicted ids are remembered for the same window, so a span that arrives
//! after eviction is reported late instead of opening the trace again.

pub mod record;

pub use record::{Span, SpanStatus, TraceRecord, TraceState, TraceView};

use crate::error::TraceError;
use crate::periodic::spawn_periodic;
use crate::series::window_start;
use crate::stats::Distribution;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Distinct undeclared stage names counted individually; the rest are
/// counted under [`OTHER_STAGES`].
pub const MAX_EXTRANEOUS_STAGES: usize = 64;

/// Undeclared-stage spans kept on a single trace record.
pub const MAX_EXTRANEOUS_SPANS: usize = 16;

pub const OTHER_STAGES: &str = "other";

#[derive(Debug, Clone)]
pub struct TraceConfig {
    /// Declared pipeline order.
    pub stages: Vec<String>,
    pub completion_timeout: Duration,
    pub grace_period: Duration,
    pub continuity_window: Duration,
    pub scan_period: Duration,
    pub max_outcomes: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            stages: ["ingestion", "recognition", "execution", "policy", "verification"]
                .into_iter()
                .map(String::from)
                .collect(),
            completion_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(300),
            continuity_window: Duration::from_secs(3600),
            scan_period: Duration::from_secs(5),
            max_outcomes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanOutcome {
    Recorded,
    /// The span was the last missing stage.
    Completed,
    /// Stage is not part of the declared pipeline; kept but flagged.
    Extraneous,
    /// The stage was already recorded for this trace; ignored.
    Duplicate,
    /// The trace had already reached a terminal state; ignored.
    Late,
}

#[derive(Debug, Clone)]
struct TraceOutcome {
    trace_id: String,
    closed_at: DateTime<Utc>,
    complete: bool,
    latency_ms: Option<f64>,
    missing: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub timed_out: Vec<String>,
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContinuityReport {
    pub window_seconds: u64,
    pub open: usize,
    pub complete: usize,
    pub incomplete: usize,
    pub complete_ratio: Option<f64>,
    pub incomplete_ratio: Option<f64>,
    pub latency_ms: Option<Distribution>,
    /// How often each stage was the missing one among incomplete traces.
    pub missing_stages: BTreeMap<String, u64>,
    /// Spans seen for undeclared stages since startup.
    pub extraneous_stages: BTreeMap<String, u64>,
}

/// Ids of evicted traces, oldest first.
#[derive(Debug, Default)]
struct RetiredTraces {
    order: VecDeque<(DateTime<Utc>, String)>,
    ids: HashSet<String>,
}

impl RetiredTraces {
    fn insert(&mut self, closed_at: DateTime<Utc>, trace_id: String) {
        if self.ids.insert(trace_id.clone()) {
            self.order.push_back((closed_at, trace_id));
        }
    }

    fn contains(&self, trace_id: &str) -> bool {
        self.ids.contains(trace_id)
    }

    fn prune(&mut self, cutoff: DateTime<Utc>, max: usize) {
        while let Some((closed_at, _)) = self.order.front() {
            if *closed_at >= cutoff && self.order.len() <= max {
                break;
            }
            if let Some((_, trace_id)) = self.order.pop_front() {
                self.ids.remove(&trace_id);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

pub struct TraceTracker {
    config: TraceConfig,
    records: RwLock<HashMap<String, Arc<Mutex<TraceRecord>>>>,
    // Lock order: `records` before `retired`.
    retired: Mutex<RetiredTraces>,
    outcomes: Mutex<VecDeque<TraceOutcome>>,
    extraneous: Mutex<BTreeMap<String, u64>>,
    ready: AtomicBool,
}

impl TraceTracker {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            retired: Mutex::new(RetiredTraces::default()),
            outcomes: Mutex::new(VecDeque::new()),
            extraneous: Mutex::new(BTreeMap::new()),
            ready: AtomicBool::new(false),
        }
    }

    pub fn stages(&self) -> &[String] {
        &self.config.stages
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn record_span(&self, span: Span) -> Result<SpanOutcome, TraceError> {
        self.record_span_at(span, Utc::now())
    }

    /// Records `span`, with `now` as the arrival time used for timeouts.
    pub fn record_span_at(&self, span: Span, now: DateTime<Utc>) -> Result<SpanOutcome, TraceError> {
        span.validate()?;

        let Some(record) = self.record_for(&span.trace_id, now) else {
            debug!(trace_id = %span.trace_id, stage = %span.stage, "Ignoring span for evicted trace");
            return Ok(SpanOutcome::Late);
        };
        let mut record = record.lock();

        if record.state.is_terminal() {
            debug!(trace_id = %span.trace_id, stage = %span.stage, "Ignoring span for closed trace");
            return Ok(SpanOutcome::Late);
        }
        if record.span(&span.stage).is_some() {
            return Ok(SpanOutcome::Duplicate);
        }

        if !self.config.stages.contains(&span.stage) {
            debug!(trace_id = %span.trace_id, stage = %span.stage, "Span for undeclared stage");
            self.count_extraneous(&span.stage);
            if record.extraneous_stages(&self.config.stages).len() < MAX_EXTRANEOUS_SPANS {
                record.insert(span);
            }
            return Ok(SpanOutcome::Extraneous);
        }
        record.insert(span);

        if !record.missing_stages(&self.config.stages).is_empty() {
            return Ok(SpanOutcome::Recorded);
        }

        record.state = TraceState::Complete;
        record.closed_at = Some(now);
        let latency_ms = record.latency_ms(&self.config.stages);
        debug!(trace_id = %record.trace_id, latency_ms = ?latency_ms, "Trace complete");
        self.push_outcome(TraceOutcome {
            trace_id: record.trace_id.clone(),
            closed_at: now,
            complete: true,
            latency_ms,
            missing: Vec::new(),
        });

        Ok(SpanOutcome::Completed)
    }

    pub fn query_trace(&self, trace_id: &str) -> Option<TraceView> {
        let record = self.records.read().get(trace_id).cloned()?;
        let view = record.lock().view(&self.config.stages);
        Some(view)
    }

    pub fn query_continuity(&self) -> ContinuityReport {
        self.query_continuity_at(Utc::now())
    }

    pub fn query_continuity_at(&self, now: DateTime<Utc>) -> ContinuityReport {
        let since = window_start(now, self.config.continuity_window);
        let open = self
            .record_handles()
            .iter()
            .filter(|r| r.lock().state == TraceState::Open)
            .count();

        let mut complete = 0;
        let mut incomplete = 0;
        let mut latencies = Vec::new();
        let mut missing_stages = BTreeMap::new();
        {
            let outcomes = self.outcomes.lock();
            for outcome in outcomes.iter().filter(|o| o.closed_at >= since) {
                if outcome.complete {
                    complete += 1;
                    latencies.extend(outcome.latency_ms);
                } else {
                    incomplete += 1;
                    for stage in &outcome.missing {
                        *missing_stages.entry(stage.clone()).or_insert(0) += 1;
                    }
                }
            }
        }

        let closed = complete + incomplete;
        let ratio = |n: usize| (closed > 0).then(|| n as f64 / closed as f64);

        ContinuityReport {
            window_seconds: self.config.continuity_window.as_secs(),
            open,
            complete,
            incomplete,
            complete_ratio: ratio(complete),
            incomplete_ratio: ratio(incomplete),
            latency_ms: Distribution::from_values(latencies),
            missing_stages,
            extraneous_stages: self.extraneous.lock().clone(),
        }
    }

    pub fn scan(&self) -> ScanReport {
        self.scan_at(Utc::now())
    }

    /// Times out stale open traces, evicts terminal ones past the grace
    /// period and prunes outcome history outside the continuity window.
    pub fn scan_at(&self, now: DateTime<Utc>) -> ScanReport {
        let timeout_cutoff = window_start(now, self.config.completion_timeout);
        let grace_cutoff = window_start(now, self.config.grace_period);
        let mut report = ScanReport::default();
        let mut expired = Vec::new();

        for handle in self.record_handles() {
            let mut record = handle.lock();
            match record.state {
                TraceState::Open if record.opened_at < timeout_cutoff => {
                    let missing = record.missing_stages(&self.config.stages);
                    info!(
                        trace_id = %record.trace_id,
                        missing = ?missing,
                        "Trace timed out before all stages reported"
                    );
                    record.state = TraceState::Incomplete;
                    record.closed_at = Some(now);
                    report.timed_out.push(record.trace_id.clone());
                    self.push_outcome(TraceOutcome {
                        trace_id: record.trace_id.clone(),
                        closed_at: now,
                        complete: false,
                        latency_ms: None,
                        missing,
                    });
                }
                TraceState::Complete | TraceState::Incomplete => match record.closed_at {
                    Some(closed) if closed < grace_cutoff => {
                        expired.push((closed, record.trace_id.clone()));
                    }
                    _ => {}
                },
                TraceState::Open => {}
            }
        }

        let history_cutoff = window_start(now, self.config.continuity_window);
        {
            let mut records = self.records.write();
            let mut retired = self.retired.lock();
            expired.sort();
            for (closed_at, trace_id) in expired {
                records.remove(&trace_id);
                retired.insert(closed_at, trace_id);
                report.evicted += 1;
            }
            retired.prune(history_cutoff, self.config.max_outcomes);
        }

        let mut outcomes = self.outcomes.lock();
        while outcomes.front().is_some_and(|o| o.closed_at < history_cutoff) {
            outcomes.pop_front();
        }

        report
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Number of evicted trace ids still remembered.
    pub fn retired_len(&self) -> usize {
        self.retired.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Returns the live record for `trace_id`, opening one if needed, or
    /// `None` if the trace was already evicted.
    fn record_for(&self, trace_id: &str, now: DateTime<Utc>) -> Option<Arc<Mutex<TraceRecord>>> {
        if let Some(record) = self.records.read().get(trace_id) {
            return Some(record.clone());
        }

        let mut records = self.records.write();
        if let Some(record) = records.get(trace_id) {
            return Some(record.clone());
        }
        if self.retired.lock().contains(trace_id) {
            return None;
        }
        let record = Arc::new(Mutex::new(TraceRecord::new(trace_id, now)));
        records.insert(trace_id.to_string(), record.clone());
        Some(record)
    }

    fn count_extraneous(&self, stage: &str) {
        let mut extraneous = self.extraneous.lock();
        if let Some(count) = extraneous.get_mut(stage) {
            *count += 1;
            return;
        }
        let tracked = extraneous.len() - usize::from(extraneous.contains_key(OTHER_STAGES));
        let key = if tracked < MAX_EXTRANEOUS_STAGES {
            stage
        } else {
            OTHER_STAGES
        };
        *extraneous.entry(key.to_string()).or_insert(0) += 1;
    }

    fn record_handles(&self) -> Vec<Arc<Mutex<TraceRecord>>> {
        self.records.read().values().cloned().collect()
    }

    fn push_outcome(&self, outcome: TraceOutcome) {
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(outcome);
        while outcomes.len() > self.config.max_outcomes {
            outcomes.pop_front();
        }
    }
}

impl Default for TraceTracker {
    fn default() -> Self {
        Self::new(TraceConfig::default())
    }
}

/// Background task that drives trace timeouts and eviction.
pub struct TimeoutScanner {
    tracker: Arc<TraceTracker>,
}

impl TimeoutScanner {
    pub fn new(tracker: Arc<TraceTracker>) -> Self {
        Self { tracker }
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        let period = self.tracker.config.scan_period;
        spawn_periodic("trace-timeout-scanner", period, shutdown, move || {
            let report = self.tracker.scan();
            if !report.timed_out.is_empty() || report.evicted > 0 {
                debug!(
                    timed_out = report.timed_out.len(),
                    evicted = report.evicted,
                    "Trace scan finished"
                );
            }
        })
    }
}
