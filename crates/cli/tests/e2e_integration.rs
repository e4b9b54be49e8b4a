//! End-to-end integration tests for the mcpagent runtime.
//!
//! These tests drive the full pipeline from query to answer: graph
//! construction, tool invocation, tool-set reconciliation with restarts,
//! structured output extraction and telemetry.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use mcpagent_agent::{
    ACTIVATE_GROUP_TOOL, Agent, AgentError, AgentEvent, AgentOptions, OutputSchema, RunOptions,
    StreamItem, ToolGroupManager,
};
use mcpagent_config::AgentConfig;
use mcpagent_core::{
    ChunkReceiver, DeltaReceiver, LanguageModel, Message, MessageToolCall, ModelRequest,
    ProviderError, StreamChunk, StructuredRequest, Tool, ToolError, ToolRegistry, ToolResult,
};
use mcpagent_telemetry::{ExecutionMethod, MemoryReporter};
use tokio::sync::mpsc;

// ── Mock Model ───────────────────────────────────────────────────────────

/// A model that replays scripted assistant turns and structured replies.
struct ScriptedModel {
    turns: Mutex<VecDeque<Message>>,
    structured: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<ModelRequest>>,
    structured_prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(turns: Vec<Message>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            structured: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            structured_prompts: Mutex::new(Vec::new()),
        }
    }

    fn with_structured(self, replies: &[&str]) -> Self {
        *self.structured.lock().unwrap() = replies.iter().map(|r| r.to_string()).collect();
        self
    }

    fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn structured_prompts(&self) -> Vec<String> {
        self.structured_prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LanguageModel for ScriptedModel {
    fn provider_name(&self) -> &str {
        "e2e_mock"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn respond(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let turn = self.turns.lock().unwrap().pop_front().ok_or_else(|| {
            ProviderError::ApiError {
                status_code: 500,
                message: "script exhausted".into(),
            }
        })?;

        let (tx, rx) = mpsc::channel(8);
        let text = turn.text();
        if !text.is_empty() {
            tx.send(Ok(StreamChunk::text(text))).await.ok();
        }
        tx.send(Ok(StreamChunk::finish(turn.tool_calls))).await.ok();
        Ok(rx)
    }

    async fn respond_structured(
        &self,
        request: StructuredRequest,
    ) -> Result<DeltaReceiver, ProviderError> {
        self.structured_prompts.lock().unwrap().push(request.prompt);
        let reply = self.structured.lock().unwrap().pop_front().ok_or_else(|| {
            ProviderError::ApiError {
                status_code: 500,
                message: "no structured reply scripted".into(),
            }
        })?;

        let (tx, rx) = mpsc::channel(8);
        tx.send(Ok(reply)).await.ok();
        Ok(rx)
    }
}

fn text_turn(text: &str) -> Message {
    Message::assistant(text)
}

fn tool_turn(thought: &str, name: &str, args: serde_json::Value) -> Message {
    Message::assistant_with_tool_calls(
        thought,
        vec![MessageToolCall {
            id: format!("call_{name}"),
            name: name.to_string(),
            arguments: args,
        }],
    )
}

// ── Tools ────────────────────────────────────────────────────────────────

struct AddTool;

#[async_trait::async_trait]
impl Tool for AddTool {
    fn name(&self) -> &str {
        "add"
    }

    fn description(&self) -> &str {
        "Add two numbers"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let a = arguments["a"]
            .as_f64()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'a'".into()))?;
        let b = arguments["b"]
            .as_f64()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'b'".into()))?;
        Ok(ToolResult::ok(format!("{}", a + b)))
    }
}

struct WeatherTool;

#[async_trait::async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather"
    }

    fn description(&self) -> &str {
        "Current weather for a city"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {"city": {"type": "string"}}})
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let city = arguments["city"].as_str().unwrap_or("somewhere");
        Ok(ToolResult::ok(format!("Sunny and 21 degrees in {city}")))
    }
}

/// Registers the weather tool into a shared registry when invoked.
struct InstallWeatherTool {
    registry: Arc<ToolRegistry>,
}

#[async_trait::async_trait]
impl Tool for InstallWeatherTool {
    fn name(&self) -> &str {
        "install_weather"
    }

    fn description(&self) -> &str {
        "Install the weather tool"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        self.registry.register(Arc::new(WeatherTool));
        Ok(ToolResult::ok("weather installed"))
    }
}

fn weather_schema() -> OutputSchema {
    OutputSchema::from_value(serde_json::json!({
        "title": "Weather",
        "type": "object",
        "properties": {
            "city": {"type": "string", "description": "City name"},
            "temperature": {"type": "integer", "description": "Degrees Celsius"}
        },
        "required": ["city", "temperature"]
    }))
}

// ── E2E: Tool invocation ─────────────────────────────────────────────────

#[tokio::test]
async fn e2e_run_invokes_tool_and_reports() {
    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn("Let me add those.", "add", serde_json::json!({"a": 2, "b": 3})),
        text_turn("2 + 3 = 5"),
    ]));
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(AddTool));
    let reporter = Arc::new(MemoryReporter::new(10));

    let agent = Agent::builder(model.clone(), registry)
        .reporter(reporter.clone())
        .build();
    let outcome = agent.run("What is 2 + 3?", RunOptions::new()).await.unwrap();

    assert_eq!(outcome.output, "2 + 3 = 5");
    assert_eq!(outcome.steps, 1);
    assert_eq!(outcome.restarts, 0);

    // The second turn sees the tool result
    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].messages.iter().any(|m| m.text() == "5"));

    let summaries = reporter.summaries();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert!(summary.success);
    assert_eq!(summary.execution_method, ExecutionMethod::Run);
    assert_eq!(summary.model_provider, "e2e_mock");
    assert_eq!(summary.tools_used_names, vec!["add".to_string()]);
    assert_eq!(summary.response.as_deref(), Some("2 + 3 = 5"));
}

#[tokio::test]
async fn e2e_failed_tool_is_fed_back_to_the_model() {
    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn("", "add", serde_json::json!({"a": 2})),
        text_turn("I could not add those."),
    ]));
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(AddTool));

    let agent = Agent::builder(model.clone(), registry).build();
    let outcome = agent.run("Add 2 and nothing", RunOptions::new()).await.unwrap();

    assert_eq!(outcome.output, "I could not add those.");
    let requests = model.requests();
    assert!(requests[1].messages.iter().any(|m| m.text().contains("Missing 'b'")));
}

// ── E2E: Tool-set changes ────────────────────────────────────────────────

#[tokio::test]
async fn e2e_registry_change_restarts_with_new_tool() {
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(InstallWeatherTool {
        registry: registry.clone(),
    }));
    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn("", "install_weather", serde_json::json!({})),
        tool_turn("", "weather", serde_json::json!({"city": "Paris"})),
        text_turn("It is sunny in Paris."),
    ]));
    let reporter = Arc::new(MemoryReporter::new(10));

    let agent = Agent::builder(model.clone(), registry)
        .reporter(reporter.clone())
        .build();
    let outcome = agent.run("Weather in Paris?", RunOptions::new()).await.unwrap();

    assert_eq!(outcome.output, "It is sunny in Paris.");
    assert_eq!(outcome.restarts, 1);
    assert_eq!(outcome.steps, 2);

    let first_tools: Vec<String> = model.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
    let second_tools: Vec<String> = model.requests()[1].tools.iter().map(|t| t.name.clone()).collect();
    assert!(!first_tools.contains(&"weather".to_string()));
    assert!(second_tools.contains(&"weather".to_string()));

    assert_eq!(reporter.summaries()[0].restarts, 1);
}

#[tokio::test]
async fn e2e_group_activation_streams_restart_event() {
    let groups = Arc::new(ToolGroupManager::new().with_group(
        "weather",
        "Weather lookups",
        vec![Arc::new(WeatherTool) as Arc<dyn Tool>],
    ));
    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn("", ACTIVATE_GROUP_TOOL, serde_json::json!({"group": "weather"})),
        tool_turn("", "weather", serde_json::json!({"city": "Oslo"})),
        text_turn("Sunny in Oslo."),
    ]));

    let agent = Agent::builder(model, groups).build();
    let events: Vec<AgentEvent> = agent
        .stream_events("Weather in Oslo?", RunOptions::new())
        .map(|e| e.unwrap())
        .collect()
        .await;

    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::Restarted { tools, .. } if tools.contains(&"weather".to_string())
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        AgentEvent::ToolEnd { name, success: true, output, .. }
            if name == "weather" && output.contains("Oslo")
    )));
    match events.last() {
        Some(AgentEvent::Done { restarts, .. }) => assert_eq!(*restarts, 1),
        other => panic!("expected Done last, got {other:?}"),
    }
}

// ── E2E: Streaming steps ─────────────────────────────────────────────────

#[tokio::test]
async fn e2e_stream_yields_call_step_and_final() {
    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn("Adding.", "add", serde_json::json!({"a": 1, "b": 1})),
        text_turn("Two."),
    ]));
    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(AddTool));

    let agent = Agent::builder(model, registry).build();
    let items: Vec<StreamItem> = agent
        .stream("1 + 1?", RunOptions::new())
        .map(|i| i.unwrap())
        .collect()
        .await;

    assert!(matches!(&items[0], StreamItem::ToolCall(action) if action.tool == "add"));
    assert!(matches!(
        &items[1],
        StreamItem::Step(step) if step.observation.as_deref() == Some("2")
    ));
    assert_eq!(items.last(), Some(&StreamItem::Final("Two.".into())));
}

// ── E2E: Structured output ───────────────────────────────────────────────

#[tokio::test]
async fn e2e_structured_output_retries_with_feedback() {
    let model = Arc::new(
        ScriptedModel::new(vec![text_turn("Paris is at 21 degrees.")]).with_structured(&[
            r#"{"city": "Paris"}"#,
            r#"{"city": "Paris", "temperature": 21}"#,
        ]),
    );
    let agent = Agent::builder(model.clone(), Arc::new(ToolRegistry::new())).build();

    let outcome = agent
        .run("Weather in Paris?", RunOptions::new().output_schema(weather_schema()))
        .await
        .unwrap();

    assert_eq!(outcome.output, "Paris is at 21 degrees.");
    let structured = outcome.structured.unwrap();
    assert_eq!(structured["city"], "Paris");
    assert_eq!(structured["temperature"], 21);

    let prompts = model.structured_prompts();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("The previous attempt failed validation"));
}

#[tokio::test]
async fn e2e_structured_output_failure_keeps_free_text() {
    let model = Arc::new(
        ScriptedModel::new(vec![text_turn("No idea, sorry.")])
            .with_structured(&["not json", "still not json", "{}"]),
    );
    let reporter = Arc::new(MemoryReporter::new(10));
    let agent = Agent::builder(model, Arc::new(ToolRegistry::new()))
        .reporter(reporter.clone())
        .build();

    let err = agent
        .run("Weather?", RunOptions::new().output_schema(weather_schema()))
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Extraction { .. }));
    assert_eq!(err.final_output(), Some("No idea, sorry."));

    let summary = &reporter.summaries()[0];
    assert!(!summary.success);
    assert_eq!(summary.error_type.as_deref(), Some("structured_output_error"));
}

// ── E2E: Memory ──────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_memory_spans_runs_until_cleared() {
    let model = Arc::new(ScriptedModel::new(vec![
        text_turn("Nice to meet you, Ada."),
        text_turn("Your name is Ada."),
        text_turn("I don't know."),
    ]));
    let agent = Agent::builder(model.clone(), Arc::new(ToolRegistry::new())).build();

    agent.run("My name is Ada.", RunOptions::new()).await.unwrap();
    agent.run("What is my name?", RunOptions::new()).await.unwrap();
    assert!(model.requests()[1].messages.iter().any(|m| m.text() == "My name is Ada."));

    agent.clear_conversation_history();
    agent.run("What is my name?", RunOptions::new()).await.unwrap();
    assert!(!model.requests()[2].messages.iter().any(|m| m.text() == "My name is Ada."));
}

// ── E2E: Configuration ───────────────────────────────────────────────────

#[test]
fn e2e_default_config_drives_agent_options() {
    let config: AgentConfig = toml::from_str(&AgentConfig::default_toml()).unwrap();
    config.validate().unwrap();

    let options = AgentOptions::from_config(&config);
    assert_eq!(options.max_steps, config.agent.max_steps);
    assert_eq!(options.max_restarts, config.agent.max_restarts);
    assert_eq!(
        options.structured_max_attempts,
        config.structured_output.max_attempts as usize
    );
}

#[test]
fn e2e_missing_config_file_uses_defaults() {
    let path = std::env::temp_dir().join("mcpagent-e2e-missing").join("config.toml");
    let config = AgentConfig::load_from(&path).unwrap();
    assert_eq!(config.agent.max_steps, AgentConfig::default().agent.max_steps);
}

#[test]
fn e2e_provider_builds_from_settings() {
    let config = AgentConfig::default();
    let model = mcpagent_providers::from_config(&config.provider).unwrap();
    assert_eq!(model.provider_name(), config.provider.name);
    assert_eq!(model.model_name(), config.provider.model);
}
