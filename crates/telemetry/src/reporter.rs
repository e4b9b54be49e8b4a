//! Summary reporters — where execution summaries go.
//!
//! The agent holds an injected `Arc<dyn TelemetryReporter>` and hands every
//! summary to [`report`], which never fails and never panics outward.

use crate::TelemetryError;
use crate::model::ExecutionSummary;
use mcpagent_config::{TelemetrySettings, TelemetrySink};
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// A sink for execution summaries.
///
/// `record` runs on the agent's task. Sinks that do I/O or may stall go
/// behind a [`BackgroundReporter`].
pub trait TelemetryReporter: Send + Sync {
    /// Record one summary. Must not block.
    fn record(&self, summary: &ExecutionSummary) -> Result<(), TelemetryError>;
}

/// Hand a summary to a reporter, swallowing every failure.
pub fn report(reporter: &dyn TelemetryReporter, summary: &ExecutionSummary) {
    match catch_unwind(AssertUnwindSafe(|| reporter.record(summary))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::warn!(error = %e, summary_id = %summary.id, "Failed to record execution summary");
        }
        Err(_) => {
            tracing::warn!(summary_id = %summary.id, "Telemetry reporter panicked; summary dropped");
        }
    }
}

/// Build the reporter described by the settings.
pub fn from_settings(settings: &TelemetrySettings) -> Arc<dyn TelemetryReporter> {
    if !settings.enabled {
        return Arc::new(NoopReporter);
    }
    match settings.sink {
        TelemetrySink::Log => Arc::new(TracingReporter),
        TelemetrySink::Memory => Arc::new(MemoryReporter::new(settings.max_summaries)),
        TelemetrySink::None => Arc::new(NoopReporter),
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl TelemetryReporter for NoopReporter {
    fn record(&self, _summary: &ExecutionSummary) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Emits each summary as one structured `info` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl TelemetryReporter for TracingReporter {
    fn record(&self, s: &ExecutionSummary) -> Result<(), TelemetryError> {
        let tools_used = serde_json::to_string(&s.tools_used_names)?;
        tracing::info!(
            target: "mcpagent::telemetry",
            id = %s.id,
            method = %s.execution_method,
            success = s.success,
            model = %s.model_name,
            provider = %s.model_provider,
            tools_available = s.tools_available_count,
            steps = s.steps_taken,
            max_steps = s.max_steps_used,
            restarts = s.restarts,
            tools_used = %tools_used,
            elapsed_ms = s.execution_time_ms,
            error_type = s.error_type.as_deref().unwrap_or(""),
            "Agent execution finished"
        );
        Ok(())
    }
}

/// Keeps the most recent summaries in memory (oldest evicted first).
pub struct MemoryReporter {
    capacity: usize,
    summaries: RwLock<VecDeque<ExecutionSummary>>,
}

impl MemoryReporter {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            summaries: RwLock::new(VecDeque::new()),
        }
    }

    /// Snapshot of the recorded summaries, oldest first.
    pub fn summaries(&self) -> Vec<ExecutionSummary> {
        let summaries = self.summaries.read().unwrap_or_else(|e| e.into_inner());
        summaries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.summaries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TelemetryReporter for MemoryReporter {
    fn record(&self, summary: &ExecutionSummary) -> Result<(), TelemetryError> {
        if self.capacity == 0 {
            return Err(TelemetryError::CapacityExhausted);
        }
        let mut summaries = self.summaries.write().unwrap_or_else(|e| e.into_inner());
        while summaries.len() >= self.capacity {
            summaries.pop_front();
        }
        summaries.push_back(summary.clone());
        Ok(())
    }
}

/// Hands summaries to a slow reporter on the blocking pool.
///
/// `record` only enqueues; a full queue drops the summary with
/// [`TelemetryError::CapacityExhausted`].
pub struct BackgroundReporter {
    tx: mpsc::Sender<ExecutionSummary>,
}

impl BackgroundReporter {
    /// Start the drain task. Must be called within a Tokio runtime.
    pub fn spawn(inner: Arc<dyn TelemetryReporter>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ExecutionSummary>(capacity.max(1));
        tokio::task::spawn_blocking(move || {
            while let Some(summary) = rx.blocking_recv() {
                report(inner.as_ref(), &summary);
            }
            tracing::debug!("Background reporter stopped");
        });
        Self { tx }
    }
}

impl TelemetryReporter for BackgroundReporter {
    fn record(&self, summary: &ExecutionSummary) -> Result<(), TelemetryError> {
        self.tx.try_send(summary.clone()).map_err(|e| match e {
            TrySendError::Full(_) => TelemetryError::CapacityExhausted,
            TrySendError::Closed(_) => TelemetryError::Sink("background reporter stopped".into()),
        })
    }
}
