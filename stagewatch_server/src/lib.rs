//! Read-only HTTP surface over the metrics registry, SLO evaluator and
//! trace tracker, plus the [`Runtime`] that wires them together.

pub mod routes;
pub mod runtime;
pub mod state;

pub use routes::{router, ApiError};
pub use runtime::{serve, Runtime};
pub use state::AppState;
