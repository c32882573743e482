//! Telemetry: structured logging and metric names.
//!
//! - **Logging**: `tracing-subscriber` setup with JSON/pretty/compact output
//! - **Metrics**: counter names and helpers recorded through the `metrics` facade.
//!   No recorder is installed here; the embedding application decides where
//!   metrics go.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{describe_metrics, ReconcileOutcome};
