//! Failure taxonomy of an agent run.

use crate::structured::ExtractionError;
use mcpagent_core::{ProviderError, ToolError};
use thiserror::Error;

/// Errors surfaced by [`Agent`](crate::Agent) runs.
///
/// Tool *execution* failures never appear here: they are fed back to the
/// model as tool-result text. Restart exhaustion is not an error either.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model was unreachable or rejected a request. Fatal to the run.
    #[error("Model error: {0}")]
    Model(#[from] ProviderError),

    /// The caller owns the lifecycle but did not initialize the agent.
    #[error("Agent is not initialized; call initialize() or enable lifecycle management")]
    NotInitialized,

    /// The tool provider failed to connect or close.
    #[error("Tool provider error: {0}")]
    Tool(#[from] ToolError),

    /// Structured output could not be produced. The free-text answer is
    /// still available.
    #[error("Failed to generate structured output: {error}")]
    Extraction {
        error: ExtractionError,
        final_output: String,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Short label used as the telemetry `error_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Model(_) => "model_error",
            Self::NotInitialized => "not_initialized",
            Self::Tool(_) => "tool_provider_error",
            Self::Extraction { .. } => "structured_output_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// The free-text answer, when the run got that far.
    pub fn final_output(&self) -> Option<&str> {
        match self {
            Self::Extraction { final_output, .. } => Some(final_output),
            _ => None,
        }
    }
}
