//! Items and events produced by the agent's streaming entry points.
//!
//! `stream()` yields [`StreamItem`]s: discrete agent steps, the final answer
//! and optionally a structured result. `stream_events()` yields
//! [`AgentEvent`]s: token deltas and tool markers for token-level rendering.

use serde::{Deserialize, Serialize};

/// A tool call the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    pub tool: String,
    pub tool_input: serde_json::Value,
    /// Text the model produced alongside the call
    pub log: String,
}

/// One tool call and, once the tool returned, its observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    pub action: AgentAction,
    /// `None` while the call is in flight.
    pub observation: Option<String>,
}

impl AgentStep {
    pub fn in_flight(action: AgentAction) -> Self {
        Self {
            action,
            observation: None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.observation.is_none()
    }
}

/// Items yielded by `Agent::stream`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    /// The reasoning plan, when one was requested.
    Plan(String),
    /// The model requested a tool call; the step has no observation yet.
    ToolCall(AgentAction),
    /// A tool returned; the step carries its observation.
    Step(AgentStep),
    /// The final free-text answer.
    Final(String),
    /// The schema-validated result, when an output schema was given.
    Structured(serde_json::Value),
}

/// Events emitted by `Agent::stream_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Partial text token from the model.
    Token { content: String },

    /// A tool is being invoked.
    ToolStart {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Tool invocation completed.
    ToolEnd {
        id: String,
        name: String,
        output: String,
        success: bool,
    },

    /// The tool set changed and execution restarted with the new tools.
    Restarted { restart: usize, tools: Vec<String> },

    /// Structured extraction is still running.
    StructuredProgress { elapsed_ms: u64 },

    /// Structured extraction finished.
    StructuredOutput { value: serde_json::Value },

    /// The stream is complete.
    Done {
        output: String,
        steps: usize,
        restarts: usize,
    },
}

impl AgentEvent {
    /// Event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Restarted { .. } => "restarted",
            Self::StructuredProgress { .. } => "structured_progress",
            Self::StructuredOutput { .. } => "structured_output",
            Self::Done { .. } => "done",
        }
    }
}
