//! Observability module for logging and metrics.

pub mod logging;
pub mod metrics;

pub use logging::{init_tracing, redact_headers, LogConfig, LogFormat, LogLevel};
pub use metrics::{MetricsListener, MetricsSnapshot};
