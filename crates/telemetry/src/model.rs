//! Data model for execution summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which entry point produced a summary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMethod {
    /// Collected run returning the final answer.
    Run,
    /// Step-level streaming.
    Stream,
    /// Token-level event streaming.
    StreamEvents,
}

impl std::fmt::Display for ExecutionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::Stream => write!(f, "stream"),
            Self::StreamEvents => write!(f, "stream_events"),
        }
    }
}

/// One finished (or abandoned) agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    /// Unique identifier.
    pub id: String,
    /// When the summary was produced.
    pub recorded_at: DateTime<Utc>,
    pub execution_method: ExecutionMethod,
    pub query: String,
    pub success: bool,
    pub model_provider: String,
    pub model_name: String,
    pub tools_available_count: usize,
    pub tools_available_names: Vec<String>,
    pub max_steps_configured: usize,
    /// The budget actually applied (a per-call override wins).
    pub max_steps_used: usize,
    pub memory_enabled: bool,
    pub manage_lifecycle: bool,
    pub external_history_used: bool,
    pub steps_taken: usize,
    pub tools_used_count: usize,
    pub tools_used_names: Vec<String>,
    pub restarts: usize,
    /// Final answer text, or a length marker for event streams.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub conversation_history_length: usize,
}

impl ExecutionSummary {
    /// Create an empty summary for a query; the caller fills the rest.
    pub fn new(execution_method: ExecutionMethod, query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            execution_method,
            query: query.into(),
            success: false,
            model_provider: String::new(),
            model_name: String::new(),
            tools_available_count: 0,
            tools_available_names: vec![],
            max_steps_configured: 0,
            max_steps_used: 0,
            memory_enabled: false,
            manage_lifecycle: false,
            external_history_used: false,
            steps_taken: 0,
            tools_used_count: 0,
            tools_used_names: vec![],
            restarts: 0,
            response: None,
            execution_time_ms: 0,
            error_type: None,
            conversation_history_length: 0,
        }
    }

    /// Marker used instead of the full text for token-streamed responses.
    pub fn streamed_response_marker(chars: usize) -> String {
        format!("[STREAMED RESPONSE - {chars} chars]")
    }
}
