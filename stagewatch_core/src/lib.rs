pub mod error;
pub mod identity;
pub mod instrument;
pub mod periodic;
pub mod registry;
pub mod series;
pub mod stats;
pub mod sweeper;
pub mod trace;

pub use error::{MetricError, Result, TraceError};
pub use identity::MetricId;
pub use instrument::{
    exponential_buckets, BucketCount, Instrument, InstrumentSnapshot, MetricKind, QuantileValue,
    SeriesWindow, SnapshotValue,
};
pub use registry::{MetricRegistry, RegistryConfig, Snapshot, SweepReport};
pub use series::{BucketSeries, Sample, TimeSeries};
pub use sweeper::{RetentionConfig, RetentionSweeper};
pub use trace::{
    ContinuityReport, Span, SpanOutcome, SpanStatus, TimeoutScanner, TraceConfig, TraceState,
    TraceTracker, TraceView,
};
