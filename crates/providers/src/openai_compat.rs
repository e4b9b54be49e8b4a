//! OpenAI-compatible language model implementation.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, and any
//! endpoint exposing `/chat/completions` with SSE streaming.
//!
//! Supports:
//! - Streaming chat completions with tool calling
//! - Structured output via `response_format: json_schema`

use async_trait::async_trait;
use futures::StreamExt;
use mcpagent_config::ProviderSettings;
use mcpagent_core::error::ProviderError;
use mcpagent_core::message::{Message, MessageToolCall, Role};
use mcpagent_core::provider::*;
use mcpagent_core::tool::ToolDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible language model.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider with a 120s request timeout.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            temperature: 0.2,
            max_tokens: None,
            client: build_client(120)?,
        })
    }

    /// Create a provider from the `[provider]` configuration section.
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self, ProviderError> {
        Ok(Self {
            name: settings.name.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            client: build_client(settings.timeout_secs)?,
        })
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openai", "https://api.openai.com/v1", Some(api_key.into()), model)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>, model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            None,
            model,
        )
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Convert our Message types to OpenAI API format.
    fn to_api_messages(system_prompt: Option<&str>, messages: &[Message]) -> Vec<ApiMessage> {
        let system = system_prompt.map(|prompt| ApiMessage {
            role: "system".into(),
            content: Some(prompt.to_string()),
            tool_calls: None,
            tool_call_id: None,
        });

        system
            .into_iter()
            .chain(messages.iter().map(|m| {
                let text = m.text();
                ApiMessage {
                    role: match m.role {
                        Role::User => "user".into(),
                        Role::Assistant => "assistant".into(),
                        Role::System => "system".into(),
                        Role::Tool => "tool".into(),
                    },
                    // Assistant turns that only call tools carry no content
                    content: if text.is_empty() && m.has_tool_calls() {
                        None
                    } else {
                        Some(text)
                    },
                    tool_calls: if m.tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            m.tool_calls
                                .iter()
                                .map(|tc| ApiToolCall {
                                    id: tc.id.clone(),
                                    r#type: "function".into(),
                                    function: ApiFunction {
                                        name: tc.name.clone(),
                                        arguments: tc.arguments.to_string(),
                                    },
                                })
                                .collect(),
                        )
                    },
                    tool_call_id: m.tool_call_id.clone(),
                }
            }))
            .collect()
    }

    /// Convert tool descriptors to OpenAI API format.
    fn to_api_tools(tools: &[ToolDescriptor]) -> Vec<ApiToolDefinition> {
        tools
            .iter()
            .map(|t| ApiToolDefinition {
                r#type: "function".into(),
                function: ApiToolFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    }

    fn chat_body(&self, request: &ModelRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": Self::to_api_messages(request.system_prompt.as_deref(), &request.messages),
            "temperature": request.temperature.unwrap_or(self.temperature),
            "stream": true,
            "stream_options": { "include_usage": true },
        });

        if let Some(max_tokens) = request.max_tokens.or(self.max_tokens) {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(Self::to_api_tools(&request.tools));
        }

        body
    }

    fn structured_body(&self, request: &StructuredRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": request.prompt }],
            "temperature": 0.0,
            "stream": true,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": request.schema_name,
                    "schema": request.schema,
                },
            },
        });

        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        body
    }

    /// POST a streaming request and map error statuses.
    async fn post_stream(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(body);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(e.to_string())
            } else {
                ProviderError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

fn build_client(timeout_secs: u64) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("Failed to create HTTP client: {e}")))
}

#[async_trait]
impl LanguageModel for OpenAiCompatProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn respond(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        let body = self.chat_body(&request);

        debug!(
            provider = %self.name,
            model = %self.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Sending streaming request"
        );

        let response = self.post_stream(&body).await?;

        let (tx, rx) = mpsc::channel(64);
        let provider_name = self.name.clone();

        // Spawn task to read the SSE byte stream and parse chunks
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLines::default();
            let mut turn = TurnAccumulator::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for data in lines.push(&bytes) {
                    // "[DONE]" signals end of stream
                    if data == "[DONE]" {
                        let _ = tx.send(Ok(turn.finish(None))).await;
                        return;
                    }

                    match serde_json::from_str::<StreamResponse>(&data) {
                        Ok(stream_resp) => {
                            if let Some(delta) = turn.apply(&stream_resp) {
                                if tx.send(Ok(StreamChunk::text(delta))).await.is_err() {
                                    return; // receiver dropped
                                }
                            }

                            // Usage arrives in the last chunk (stream_options)
                            if let Some(usage) = stream_resp.usage {
                                let _ = tx.send(Ok(turn.finish(Some(usage.into())))).await;
                                return;
                            }
                        }
                        Err(e) => {
                            trace!(
                                provider = %provider_name,
                                data = %data,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                        }
                    }
                }
            }

            // Stream ended without [DONE]
            let _ = tx.send(Ok(turn.finish(None))).await;
        });

        Ok(rx)
    }

    async fn respond_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<DeltaReceiver, ProviderError> {
        let body = self.structured_body(&request);

        debug!(
            provider = %self.name,
            model = %self.model,
            schema = %request.schema_name,
            "Sending structured output request"
        );

        let response = self.post_stream(&body).await?;

        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut lines = SseLines::default();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(ProviderError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                for data in lines.push(&bytes) {
                    if data == "[DONE]" {
                        return;
                    }
                    let Ok(stream_resp) = serde_json::from_str::<StreamResponse>(&data) else {
                        continue;
                    };
                    let delta = stream_resp
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.delta.content)
                        .filter(|c| !c.is_empty());
                    if let Some(delta) = delta {
                        if tx.send(Ok(delta)).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Splits an SSE byte stream into `data:` payloads.
#[derive(Default)]
struct SseLines {
    /// Raw bytes; a multi-byte character may straddle two chunks
    buffer: Vec<u8>,
}

impl SseLines {
    /// Feed raw bytes; returns every complete `data:` payload.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let decoded = String::from_utf8_lossy(&raw[..line_end]);
            let line = decoded.trim_end_matches('\r');

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim().to_string());
            }
        }
        payloads
    }
}

/// Collects one streamed model turn.
#[derive(Default)]
struct TurnAccumulator {
    /// Tool call deltas keyed by index, kept in emission order
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
}

impl TurnAccumulator {
    /// Fold one SSE chunk in; returns its text delta, if any.
    fn apply(&mut self, stream_resp: &StreamResponse) -> Option<String> {
        let choice = stream_resp.choices.first()?;
        let delta = &choice.delta;

        if let Some(ref tc_deltas) = delta.tool_calls {
            for tc_delta in tc_deltas {
                let acc = self.tool_calls.entry(tc_delta.index).or_default();

                if let Some(ref id) = tc_delta.id {
                    acc.id = id.clone();
                }
                if let Some(ref func) = tc_delta.function {
                    if let Some(ref name) = func.name {
                        acc.name = name.clone();
                    }
                    if let Some(ref args) = func.arguments {
                        acc.arguments.push_str(args);
                    }
                }
            }
        }

        delta.content.clone().filter(|c| !c.is_empty())
    }

    /// The terminal chunk, carrying every completed tool call.
    fn finish(&mut self, usage: Option<Usage>) -> StreamChunk {
        let tool_calls = std::mem::take(&mut self.tool_calls)
            .into_values()
            .map(|acc| acc.to_tool_call())
            .collect();
        StreamChunk {
            content: None,
            tool_calls,
            done: true,
            usage,
        }
    }
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ApiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolCall {
    id: String,
    r#type: String,
    function: ApiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolDefinition {
    r#type: String,
    function: ApiToolFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiToolFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

impl From<ApiUsage> for Usage {
    fn from(u: ApiUsage) -> Self {
        Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }
    }
}

// --- Streaming SSE types ---

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

/// A tool call delta — arrives incrementally across chunks.
#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Accumulates incremental tool call deltas into a complete tool call.
#[derive(Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    /// Arguments that are not valid JSON are passed through as a string.
    fn to_tool_call(&self) -> MessageToolCall {
        let arguments = if self.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments)
                .unwrap_or_else(|_| serde_json::Value::String(self.arguments.clone()))
        };
        MessageToolCall {
            id: self.id.clone(),
            name: self.name.clone(),
            arguments,
        }
    }
}
