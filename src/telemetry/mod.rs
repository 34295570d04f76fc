//! Telemetry and logging infrastructure
//!
//! Provides structured logging with tracing and inference timing stats.

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LoggingError};
pub use metrics::{InferenceProfiler, InferenceStats};
