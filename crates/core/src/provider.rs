//! Language model trait — the abstraction over LLM backends.
//!
//! A language model receives the conversation, a system prompt, and the
//! tool descriptors it may call, and streams back response chunks. Some
//! chunks carry text deltas; the terminal chunk carries any tool calls the
//! model wants to make.
//!
//! Implementations: OpenAI-compatible endpoints, scripted models in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use crate::error::ProviderError;
use crate::message::{Message, MessageContent, MessageToolCall};
use crate::tool::ToolDescriptor;

/// One model turn request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The conversation messages (without the system prompt)
    pub messages: Vec<Message>,

    /// System prompt, sent ahead of the messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDescriptor>,

    /// Temperature override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A request for output that conforms to a JSON schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredRequest {
    /// Formatting instruction (carries the raw text to structure)
    pub prompt: String,

    /// Schema name, as some backends require one
    pub schema_name: String,

    /// JSON Schema of the expected object
    pub schema: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Completed tool call requests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn finish(tool_calls: Vec<MessageToolCall>) -> Self {
        Self {
            tool_calls,
            done: true,
            ..Self::default()
        }
    }
}

pub type ChunkReceiver = mpsc::Receiver<Result<StreamChunk, ProviderError>>;
pub type DeltaReceiver = mpsc::Receiver<Result<String, ProviderError>>;

/// The core LanguageModel trait.
///
/// The agent loop calls `respond()` without knowing which backend is being
/// used. Responses are always streamed; dropping the receiver abandons the
/// turn.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// A human-readable provider name (e.g., "openai", "openrouter").
    fn provider_name(&self) -> &str;

    /// The model identifier requests are sent to.
    fn model_name(&self) -> &str;

    /// Start a model turn and stream its chunks.
    async fn respond(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError>;

    /// Ask for output conforming to a schema, streamed as raw JSON text
    /// deltas that concatenate to the final document.
    async fn respond_structured(
        &self,
        _request: StructuredRequest,
    ) -> Result<DeltaReceiver, ProviderError> {
        Err(ProviderError::NotConfigured(format!(
            "Provider '{}' does not support structured output",
            self.provider_name()
        )))
    }

    /// Run a turn to completion and return the assistant message.
    ///
    /// Default implementation drains `respond()`.
    async fn complete(&self, request: ModelRequest) -> Result<Message, ProviderError> {
        let mut rx = self.respond(request).await?;
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if let Some(text) = chunk.content {
                content.push_str(&text);
            }
            tool_calls.extend(chunk.tool_calls);
            if chunk.done {
                break;
            }
        }
        Ok(Message::assistant_with_tool_calls(
            MessageContent::Text(content),
            tool_calls,
        ))
    }
}
