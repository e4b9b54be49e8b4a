//! Error types for the mcpagent domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each collaborator boundary has its own error enum; the agent crate
//! folds them into its own failure taxonomy.

use thiserror::Error;

/// Failures talking to a language model. These are infrastructure-level:
/// the agent loop treats every one of them as fatal for the current run.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

/// Failures invoking a tool. Execution failures are reported back to the
/// model as tool-result text; only `connect`/`close` failures escape a run.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool provider connection failed: {0}")]
    Connection(String),
}
