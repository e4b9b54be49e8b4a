//! Message domain types.
//!
//! A message is one entry on the conversation timeline. Its content is either
//! plain text or an ordered list of typed parts, so multi-part model output
//! (text spans interleaved with tool-use records) is represented without
//! inspecting untyped JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// The end user
    User,
    /// The language model
    Assistant,
    /// Tool execution result
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One typed part of a multi-part message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// A span of text.
    Text { text: String },

    /// A record of the model invoking a tool.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    /// Any part shape this crate does not model. Kept verbatim.
    #[serde(untagged)]
    Other(serde_json::Value),
}

impl ContentPart {
    /// Render this part as text for flattening.
    ///
    /// Text parts yield their text. Unknown shapes yield an inner `text`
    /// string or a nested `content` value when present, and fall back to
    /// their JSON form otherwise, so nothing is silently dropped.
    pub fn render(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::ToolUse { .. } => serde_json::to_string(self).unwrap_or_default(),
            Self::Other(value) => render_value(value),
        }
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => items.iter().map(render_value).collect(),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(text)) = map.get("text") {
                text.clone()
            } else if let Some(content) = map.get("content") {
                render_value(content)
            } else {
                value.to_string()
            }
        }
        other => other.to_string(),
    }
}

/// The body of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Flatten into a single string: parts are joined in order with no
    /// separator, each rendered via [`ContentPart::render`].
    pub fn flatten(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts.iter().map(ContentPart::render).collect(),
        }
    }

    /// Only the text spans, joined with `separator`. Tool-use and unknown
    /// parts are skipped.
    pub fn text_spans(&self, separator: &str) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(separator),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Parts(parts) => parts.is_empty(),
        }
    }
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<ContentPart>> for MessageContent {
    fn from(parts: Vec<ContentPart>) -> Self {
        Self::Parts(parts)
    }
}

/// A tool call embedded in an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageToolCall {
    /// Correlation ID, echoed back by the matching tool result
    pub id: String,

    /// Name of the tool to invoke
    pub name: String,

    /// Arguments as a JSON value
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A single message in a conversation. Immutable once appended to a log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The body
    pub content: MessageContent,

    /// Tool calls requested by the assistant (if any)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// If this is a tool result, the tool that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: MessageContent) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content,
            tool_calls: Vec::new(),
            tool_call_id: None,
            name: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::System, content.into())
    }

    /// Create a new user message.
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::User, content.into())
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::with_role(Role::Assistant, content.into())
    }

    /// Create an assistant message that requests tool calls.
    pub fn assistant_with_tool_calls(
        content: impl Into<MessageContent>,
        tool_calls: Vec<MessageToolCall>,
    ) -> Self {
        let mut msg = Self::assistant(content);
        msg.tool_calls = tool_calls;
        msg
    }

    /// Create a tool result message.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<MessageContent>,
    ) -> Self {
        let mut msg = Self::with_role(Role::Tool, content.into());
        msg.tool_call_id = Some(tool_call_id.into());
        msg.name = Some(tool_name.into());
        msg
    }

    /// The flattened text of this message.
    pub fn text(&self) -> String {
        self.content.flatten()
    }

    /// Whether this is an assistant message that requests tools.
    pub fn has_tool_calls(&self) -> bool {
        self.role == Role::Assistant && !self.tool_calls.is_empty()
    }

    /// Whether this is a plain assistant answer (no tool calls).
    pub fn is_final_answer(&self) -> bool {
        self.role == Role::Assistant && self.tool_calls.is_empty()
    }
}
