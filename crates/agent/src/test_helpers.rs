//! Scripted model and closure-backed tools for unit tests.

use async_trait::async_trait;
use mcpagent_core::provider::{ChunkReceiver, DeltaReceiver};
use mcpagent_core::{
    LanguageModel, MessageToolCall, ModelRequest, ProviderError, StreamChunk, StructuredRequest,
    Tool, ToolError, ToolResult,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// One canned model turn.
#[derive(Debug, Clone)]
pub enum Turn {
    Text(String),
    Calls {
        text: String,
        calls: Vec<MessageToolCall>,
    },
    Fail(ProviderError),
}

pub fn text(content: &str) -> Turn {
    Turn::Text(content.into())
}

pub fn calls(calls: Vec<MessageToolCall>) -> Turn {
    Turn::Calls {
        text: String::new(),
        calls,
    }
}

pub fn calls_with_text(text: &str, calls: Vec<MessageToolCall>) -> Turn {
    Turn::Calls {
        text: text.into(),
        calls,
    }
}

pub fn fail(error: ProviderError) -> Turn {
    Turn::Fail(error)
}

static CALL_IDS: AtomicUsize = AtomicUsize::new(0);

pub fn call(name: &str, arguments: serde_json::Value) -> MessageToolCall {
    MessageToolCall {
        id: format!("call_{}", CALL_IDS.fetch_add(1, Ordering::SeqCst)),
        name: name.into(),
        arguments,
    }
}

/// Replays canned turns as streamed chunks and records every request.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Turn>>,
    structured: Mutex<VecDeque<Result<String, ProviderError>>>,
    structured_delay: Option<Duration>,
    requests: Mutex<Vec<ModelRequest>>,
    structured_prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            structured: Mutex::new(VecDeque::new()),
            structured_delay: None,
            requests: Mutex::new(Vec::new()),
            structured_prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue raw JSON replies for structured requests.
    pub fn with_structured(self, replies: Vec<&str>) -> Self {
        self.with_structured_replies(replies.into_iter().map(|r| Ok(r.to_string())).collect())
    }

    pub fn with_structured_replies(self, replies: Vec<Result<String, ProviderError>>) -> Self {
        *self.structured.lock().unwrap() = replies.into();
        self
    }

    /// Delay each structured reply before its first delta.
    pub fn with_structured_delay(mut self, delay: Duration) -> Self {
        self.structured_delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn structured_prompts(&self) -> Vec<String> {
        self.structured_prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-model"
    }

    async fn respond(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let turn = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))?;

        let (text, tool_calls) = match turn {
            Turn::Text(text) => (text, Vec::new()),
            Turn::Calls { text, calls } => (text, calls),
            Turn::Fail(e) => return Err(e),
        };

        let words: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
        let (tx, rx) = mpsc::channel(words.len() + 2);
        for word in words {
            let _ = tx.send(Ok(StreamChunk::text(word))).await;
        }
        let _ = tx.send(Ok(StreamChunk::finish(tool_calls))).await;
        Ok(rx)
    }

    async fn respond_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<DeltaReceiver, ProviderError> {
        self.structured_prompts.lock().unwrap().push(request.prompt);
        let reply = self
            .structured
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("no structured reply scripted".into()))??;

        let delay = self.structured_delay;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let chars: Vec<char> = reply.chars().collect();
            for chunk in chars.chunks(8) {
                if tx.send(Ok(chunk.iter().collect())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

type ToolFn = Box<dyn Fn(serde_json::Value) -> Result<ToolResult, ToolError> + Send + Sync>;

/// A tool backed by a closure.
pub struct FnTool {
    name: String,
    description: String,
    f: ToolFn,
}

impl FnTool {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(serde_json::Value) -> Result<ToolResult, ToolError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new(Self {
            description: format!("Test tool {name}"),
            name,
            f: Box::new(f),
        })
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        (self.f)(arguments)
    }
}
