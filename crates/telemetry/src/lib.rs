//! Execution summaries and their reporters for mcpagent.
//!
//! Every agent execution, successful or not, ends in one
//! [`ExecutionSummary`] handed to an injected [`TelemetryReporter`].
//! Reporting is fire-and-forget: failures are logged and dropped.

pub mod model;
pub mod reporter;

pub use model::{ExecutionMethod, ExecutionSummary};
pub use reporter::{
    BackgroundReporter, MemoryReporter, NoopReporter, TelemetryReporter, TracingReporter,
    from_settings, report,
};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("telemetry sink failed: {0}")]
    Sink(String),

    #[error("telemetry buffer has no capacity")]
    CapacityExhausted,

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}
