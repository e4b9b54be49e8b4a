//! The agent facade: lifecycle, conversation memory and the three
//! execution entry points (`run`, `stream`, `stream_events`).

use crate::error::AgentError;
use crate::executor::{ExecutionLoop, LoopEvent, LoopSettings, truncate_for_log};
use crate::graph::{ExecutionGraph, GraphBuilder};
use crate::planner::generate_plan;
use crate::prompt::PromptConfig;
use crate::stream_event::{AgentEvent, StreamItem};
use crate::structured::{ExtractionError, OutputSchema, StructuredOutputExtractor};
use futures::StreamExt;
use futures::stream::BoxStream;
use mcpagent_config::AgentConfig;
use mcpagent_core::{LanguageModel, Message, ToolProvider};
use mcpagent_telemetry::{ExecutionMethod, ExecutionSummary, NoopReporter, TelemetryReporter};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Returned when the loop ends without a final answer.
pub const NO_OUTPUT: &str = "No output generated";

/// Agent-wide settings.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Default step budget per graph run
    pub max_steps: usize,
    /// Restarts allowed per execution
    pub max_restarts: usize,
    /// Keep a conversation history across executions
    pub memory_enabled: bool,
    /// Initialize and close the tool provider around each execution
    pub manage_lifecycle: bool,
    pub prompt: PromptConfig,
    pub disallowed_tools: Vec<String>,
    pub structured_max_attempts: usize,
    /// Interval between progress events while structured output runs
    pub heartbeat_interval: Duration,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_steps: 5,
            max_restarts: 3,
            memory_enabled: true,
            manage_lifecycle: true,
            prompt: PromptConfig::default(),
            disallowed_tools: Vec::new(),
            structured_max_attempts: 3,
            heartbeat_interval: Duration::from_secs(2),
        }
    }
}

impl AgentOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        let agent = &config.agent;
        Self {
            max_steps: agent.max_steps,
            max_restarts: agent.max_restarts,
            memory_enabled: agent.memory_enabled,
            manage_lifecycle: agent.manage_lifecycle,
            prompt: PromptConfig {
                system_prompt: agent.system_prompt.clone(),
                template: agent.system_prompt_template.clone(),
                additional_instructions: agent.additional_instructions.clone(),
            },
            disallowed_tools: agent.disallowed_tools.clone(),
            structured_max_attempts: config.structured_output.max_attempts as usize,
            heartbeat_interval: Duration::from_millis(config.structured_output.heartbeat_interval_ms),
        }
    }
}

/// Per-execution overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_steps: Option<usize>,
    pub manage_lifecycle: Option<bool>,
    /// Read-only history placed ahead of the conversation
    pub external_history: Option<Vec<Message>>,
    pub output_schema: Option<OutputSchema>,
    /// Ask for a reasoning plan before executing
    pub reasoning: bool,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_steps(mut self, steps: usize) -> Self {
        self.max_steps = Some(steps);
        self
    }

    pub fn manage_lifecycle(mut self, manage: bool) -> Self {
        self.manage_lifecycle = Some(manage);
        self
    }

    pub fn external_history(mut self, history: Vec<Message>) -> Self {
        self.external_history = Some(history);
        self
    }

    pub fn output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn reasoning(mut self, enabled: bool) -> Self {
        self.reasoning = enabled;
        self
    }
}

/// What `run` returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub output: String,
    pub structured: Option<Value>,
    pub steps: usize,
    pub restarts: usize,
}

pub struct AgentBuilder {
    model: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolProvider>,
    reporter: Arc<dyn TelemetryReporter>,
    options: AgentOptions,
}

impl AgentBuilder {
    pub fn reporter(mut self, reporter: Arc<dyn TelemetryReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Agent {
        let state = AgentState {
            initialized: false,
            history: Vec::new(),
            prompt: self.options.prompt.clone(),
            disallowed: self.options.disallowed_tools.clone(),
            graph: None,
            tools_used_names: Vec::new(),
            reasoning_plan: None,
        };
        Agent {
            inner: Arc::new(AgentInner {
                model: self.model,
                tools: self.tools,
                reporter: self.reporter,
                options: self.options,
                state: Mutex::new(state),
            }),
        }
    }
}

struct AgentState {
    initialized: bool,
    history: Vec<Message>,
    prompt: PromptConfig,
    disallowed: Vec<String>,
    graph: Option<Arc<ExecutionGraph>>,
    tools_used_names: Vec<String>,
    reasoning_plan: Option<String>,
}

struct AgentInner {
    model: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolProvider>,
    reporter: Arc<dyn TelemetryReporter>,
    options: AgentOptions,
    state: Mutex<AgentState>,
}

/// An agent driving a language model over a tool provider.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn builder(model: Arc<dyn LanguageModel>, tools: Arc<dyn ToolProvider>) -> AgentBuilder {
        AgentBuilder {
            model,
            tools,
            reporter: Arc::new(NoopReporter),
            options: AgentOptions::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, AgentState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn graph_builder(&self) -> GraphBuilder {
        let state = self.state();
        GraphBuilder::new(self.inner.model.clone(), self.inner.tools.clone())
            .with_prompt(state.prompt.clone())
            .with_disallowed_tools(state.disallowed.clone())
    }

    /// Connect the tool provider and build the first graph.
    pub async fn initialize(&self) -> Result<(), AgentError> {
        info!("Initializing agent");
        self.inner.tools.connect().await?;

        let builder = self.graph_builder();
        let graph = builder.build(builder.snapshot());
        info!(tools = graph.snapshot().len(), "Agent initialized");

        let mut state = self.state();
        state.graph = Some(graph);
        state.initialized = true;
        Ok(())
    }

    /// Close the tool provider and drop the graph.
    pub async fn close(&self) -> Result<(), AgentError> {
        {
            let mut state = self.state();
            state.initialized = false;
            state.graph = None;
        }
        self.inner.tools.close().await?;
        info!("Agent closed");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    pub fn options(&self) -> &AgentOptions {
        &self.inner.options
    }

    /// Run a query to completion.
    pub async fn run(
        &self,
        query: impl Into<String>,
        options: RunOptions,
    ) -> Result<AgentOutcome, AgentError> {
        let mut session = Session::new(self.clone(), ExecutionMethod::Run, query.into(), options);
        let mut outcome = AgentOutcome::default();
        while let Some(output) = session.next().await {
            match output? {
                Output::Final(text) => outcome.output = text,
                Output::Structured(value) => outcome.structured = Some(value),
                Output::Done { steps, restarts, .. } => {
                    outcome.steps = steps;
                    outcome.restarts = restarts;
                }
                _ => {}
            }
        }
        Ok(outcome)
    }

    /// Stream the agent's steps. Dropping the stream cancels the execution.
    pub fn stream(
        &self,
        query: impl Into<String>,
        options: RunOptions,
    ) -> BoxStream<'static, Result<StreamItem, AgentError>> {
        let session = Session::new(self.clone(), ExecutionMethod::Stream, query.into(), options);
        futures::stream::unfold(session, |mut session| async move {
            loop {
                match session.next().await? {
                    Ok(output) => {
                        if let Some(item) = output.into_stream_item() {
                            return Some((Ok(item), session));
                        }
                    }
                    Err(e) => return Some((Err(e), session)),
                }
            }
        })
        .boxed()
    }

    /// Stream token-level events. Dropping the stream cancels the execution.
    pub fn stream_events(
        &self,
        query: impl Into<String>,
        options: RunOptions,
    ) -> BoxStream<'static, Result<AgentEvent, AgentError>> {
        let session =
            Session::new(self.clone(), ExecutionMethod::StreamEvents, query.into(), options);
        futures::stream::unfold(session, |mut session| async move {
            loop {
                match session.next().await? {
                    Ok(output) => {
                        if let Some(event) = output.into_event() {
                            return Some((Ok(event), session));
                        }
                    }
                    Err(e) => return Some((Err(e), session)),
                }
            }
        })
        .boxed()
    }

    pub fn conversation_history(&self) -> Vec<Message> {
        self.state().history.clone()
    }

    pub fn clear_conversation_history(&self) {
        self.state().history.clear();
    }

    pub fn add_to_history(&self, message: Message) {
        self.state().history.push(message);
    }

    /// The system prompt of the current graph.
    pub fn system_prompt(&self) -> Option<String> {
        self.state()
            .graph
            .as_ref()
            .map(|g| g.system_prompt().to_string())
    }

    /// Replace the system prompt. Rebuilds the graph when initialized.
    pub fn set_system_prompt(&self, prompt: impl Into<String>) {
        let initialized = {
            let mut state = self.state();
            state.prompt.system_prompt = Some(prompt.into());
            state.initialized
        };
        if initialized {
            let builder = self.graph_builder();
            let graph = builder.build(builder.snapshot());
            self.state().graph = Some(graph);
            debug!("Rebuilt graph with new system prompt");
        }
    }

    /// Applied from the next execution; its pre-run check rebuilds the
    /// graph with the new filter.
    pub fn set_disallowed_tools(&self, tools: Vec<String>) {
        self.state().disallowed = tools;
    }

    pub fn disallowed_tools(&self) -> Vec<String> {
        self.state().disallowed.clone()
    }

    /// The plan from the last execution, if it asked for one.
    pub fn reasoning_plan(&self) -> Option<String> {
        self.state().reasoning_plan.clone()
    }

    /// Every tool the agent called, across executions.
    pub fn tools_used_names(&self) -> Vec<String> {
        self.state().tools_used_names.clone()
    }
}

/// Everything a session can produce; each entry point maps what it needs.
enum Output {
    Plan(String),
    Loop(LoopEvent),
    Progress(u64),
    Final(String),
    Structured(Value),
    Done {
        output: String,
        steps: usize,
        restarts: usize,
    },
}

impl Output {
    fn into_stream_item(self) -> Option<StreamItem> {
        match self {
            Self::Plan(plan) => Some(StreamItem::Plan(plan)),
            Self::Loop(LoopEvent::ToolCall(action)) => Some(StreamItem::ToolCall(action)),
            Self::Loop(LoopEvent::Step(step)) => Some(StreamItem::Step(step)),
            Self::Final(text) => Some(StreamItem::Final(text)),
            Self::Structured(value) => Some(StreamItem::Structured(value)),
            _ => None,
        }
    }

    fn into_event(self) -> Option<AgentEvent> {
        match self {
            Self::Loop(LoopEvent::Token(content)) => Some(AgentEvent::Token { content }),
            Self::Loop(LoopEvent::ToolStart(call)) => Some(AgentEvent::ToolStart {
                id: call.id,
                name: call.name,
                input: call.arguments,
            }),
            Self::Loop(LoopEvent::ToolEnd {
                call,
                output,
                success,
            }) => Some(AgentEvent::ToolEnd {
                id: call.id,
                name: call.name,
                output,
                success,
            }),
            Self::Loop(LoopEvent::Restarted { restart, tools }) => {
                Some(AgentEvent::Restarted { restart, tools })
            }
            Self::Progress(elapsed_ms) => Some(AgentEvent::StructuredProgress { elapsed_ms }),
            Self::Structured(value) => Some(AgentEvent::StructuredOutput { value }),
            Self::Done {
                output,
                steps,
                restarts,
            } => Some(AgentEvent::Done {
                output,
                steps,
                restarts,
            }),
            _ => None,
        }
    }
}

enum Phase {
    Start,
    Running,
    Extracting {
        handle: JoinHandle<Result<Value, ExtractionError>>,
        since: tokio::time::Instant,
    },
    Finished,
}

/// One execution, driven one output at a time.
struct Session {
    agent: Agent,
    method: ExecutionMethod,
    query: String,
    options: RunOptions,
    manage: bool,
    step_budget: usize,
    started: Instant,
    phase: Phase,
    outbox: VecDeque<Output>,
    exec: Option<ExecutionLoop>,
    initialized_here: bool,
    token_buffer: String,
    final_output: Option<String>,
    reported: bool,
}

impl Session {
    fn new(agent: Agent, method: ExecutionMethod, query: String, options: RunOptions) -> Self {
        let defaults = &agent.inner.options;
        let manage = options.manage_lifecycle.unwrap_or(defaults.manage_lifecycle);
        let step_budget = options.max_steps.unwrap_or(defaults.max_steps);
        Self {
            agent,
            method,
            query,
            options,
            manage,
            step_budget,
            started: Instant::now(),
            phase: Phase::Start,
            outbox: VecDeque::new(),
            exec: None,
            initialized_here: false,
            token_buffer: String::new(),
            final_output: None,
            reported: false,
        }
    }

    async fn next(&mut self) -> Option<Result<Output, AgentError>> {
        loop {
            if let Some(output) = self.outbox.pop_front() {
                return Some(Ok(output));
            }

            if let Phase::Extracting { handle, since } = &mut self.phase {
                let since = *since;
                let interval = self.agent.inner.options.heartbeat_interval;
                match tokio::time::timeout(interval, handle).await {
                    Err(_) => {
                        let elapsed_ms = since.elapsed().as_millis() as u64;
                        debug!(elapsed_ms, "Structured output still running");
                        return Some(Ok(Output::Progress(elapsed_ms)));
                    }
                    Ok(joined) => {
                        self.phase = Phase::Finished;
                        let text = self.final_output.clone().unwrap_or_default();
                        match joined {
                            Ok(Ok(value)) => {
                                info!("Structured output successful");
                                self.complete(text, Some(value)).await;
                            }
                            Ok(Err(error)) => {
                                let err = AgentError::Extraction {
                                    error,
                                    final_output: text,
                                };
                                return Some(Err(self.fail(err).await));
                            }
                            Err(join) => {
                                let err = AgentError::Internal(format!(
                                    "structured output task failed: {join}"
                                ));
                                return Some(Err(self.fail(err).await));
                            }
                        }
                        continue;
                    }
                }
            }

            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Start => match self.start().await {
                    Ok(()) => self.phase = Phase::Running,
                    Err(e) => return Some(Err(self.fail(e).await)),
                },

                Phase::Running => {
                    let Some(exec) = self.exec.as_mut() else {
                        let err = AgentError::Internal("execution loop missing".into());
                        return Some(Err(self.fail(err).await));
                    };
                    match exec.next().await {
                        Some(Ok(event)) => {
                            self.phase = Phase::Running;
                            self.observe(&event);
                            return Some(Ok(Output::Loop(event)));
                        }
                        Some(Err(e)) => return Some(Err(self.fail(e).await)),
                        None => self.on_loop_finished().await,
                    }
                }

                // Handled above
                Phase::Extracting { .. } => {}

                Phase::Finished => return None,
            }
        }
    }

    async fn start(&mut self) -> Result<(), AgentError> {
        info!(
            query = %truncate_for_log(&self.query, 50),
            method = %self.method,
            "Agent execution started"
        );

        if !self.agent.is_initialized() {
            if !self.manage {
                return Err(AgentError::NotInitialized);
            }
            self.agent.initialize().await?;
            self.initialized_here = true;
        }

        let memory_enabled = self.agent.inner.options.memory_enabled;
        let (graph, prior) = {
            let state = self.agent.state();
            let prior = if memory_enabled {
                state.history.clone()
            } else {
                Vec::new()
            };
            (state.graph.clone(), prior)
        };
        let graph = graph.ok_or_else(|| AgentError::Internal("agent has no graph".into()))?;

        if self.options.reasoning {
            let plan =
                generate_plan(self.agent.inner.model.as_ref(), &self.query, graph.snapshot()).await;
            self.agent.state().reasoning_plan = Some(plan.clone());
            self.outbox.push_back(Output::Plan(plan));
        } else {
            self.agent.state().reasoning_plan = None;
        }

        let mut seed = self.options.external_history.clone().unwrap_or_default();
        seed.extend(prior);
        let user_text = match &self.options.output_schema {
            Some(schema) => schema.enhance_query(&self.query),
            None => self.query.clone(),
        };
        seed.push(Message::user(user_text));

        debug!(
            seed_messages = seed.len(),
            step_budget = self.step_budget,
            tools = graph.snapshot().len(),
            "Starting execution loop"
        );
        self.exec = Some(ExecutionLoop::new(
            self.agent.graph_builder(),
            graph,
            seed,
            LoopSettings {
                step_budget: self.step_budget,
                max_restarts: self.agent.inner.options.max_restarts,
            },
        ));
        Ok(())
    }

    fn observe(&mut self, event: &LoopEvent) {
        match event {
            LoopEvent::Token(delta) => self.token_buffer.push_str(delta),
            // Text before a tool call is not the answer
            LoopEvent::ToolCall(_) => self.token_buffer.clear(),
            _ => {}
        }
    }

    async fn on_loop_finished(&mut self) {
        let Some(exec) = self.exec.as_ref() else {
            return;
        };

        let answer = match self.method {
            ExecutionMethod::StreamEvents if !self.token_buffer.trim().is_empty() => {
                Some(self.token_buffer.clone())
            }
            _ => exec.final_output().map(str::to_string),
        };
        if answer.is_none() {
            warn!(
                steps = exec.steps_taken(),
                partial = ?exec.partial_output().map(|p| truncate_for_log(&p, 100)),
                "Execution ended without a final answer"
            );
        }

        {
            let memory_enabled = self.agent.inner.options.memory_enabled;
            let mut state = self.agent.state();
            state.tools_used_names.extend(exec.tools_used().iter().cloned());
            if memory_enabled {
                state.history.push(Message::user(self.query.clone()));
                if let Some(answer) = &answer {
                    state.history.push(Message::assistant(answer.clone()));
                }
            }
        }

        let text = answer.clone().unwrap_or_else(|| NO_OUTPUT.to_string());
        self.final_output = Some(text.clone());

        match (self.options.output_schema.clone(), answer) {
            (Some(schema), Some(answer)) => {
                info!(schema = %schema.name, "Attempting structured output");
                let extractor = StructuredOutputExtractor::new(
                    self.agent.inner.model.clone(),
                    self.agent.inner.options.structured_max_attempts,
                );
                let handle =
                    tokio::spawn(async move { extractor.extract(&answer, &schema).await });
                self.phase = Phase::Extracting {
                    handle,
                    since: tokio::time::Instant::now(),
                };
            }
            (Some(_), None) => {
                warn!("Skipping structured output: no final answer");
                self.complete(text, None).await;
            }
            (None, _) => self.complete(text, None).await,
        }
    }

    async fn complete(&mut self, text: String, structured: Option<Value>) {
        if let Some(value) = &structured {
            if self.agent.inner.options.memory_enabled {
                self.agent
                    .add_to_history(Message::assistant(format!("Structured result: {value}")));
            }
        }

        self.teardown().await;
        self.report(true, None);

        let (steps, restarts) = self
            .exec
            .as_ref()
            .map(|e| (e.steps_taken(), e.restart_count()))
            .unwrap_or_default();
        info!(
            steps,
            restarts,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "Agent execution complete"
        );

        self.outbox.push_back(Output::Final(text.clone()));
        if let Some(value) = structured {
            self.outbox.push_back(Output::Structured(value));
        }
        self.outbox.push_back(Output::Done {
            output: text,
            steps,
            restarts,
        });
        self.phase = Phase::Finished;
    }

    async fn fail(&mut self, err: AgentError) -> AgentError {
        error!(error = %err, kind = err.kind(), "Agent execution failed");
        self.phase = Phase::Finished;
        self.outbox.clear();
        self.teardown().await;
        self.report(false, Some(err.kind()));
        err
    }

    async fn teardown(&mut self) {
        if self.initialized_here && self.manage {
            self.initialized_here = false;
            if let Err(e) = self.agent.close().await {
                warn!(error = %e, "Failed to close tool provider");
            }
        }
    }

    fn report(&mut self, success: bool, error_type: Option<&str>) {
        if self.reported {
            return;
        }
        self.reported = true;

        let inner = &self.agent.inner;
        let mut summary = ExecutionSummary::new(self.method, self.query.clone());
        summary.success = success;
        summary.model_provider = inner.model.provider_name().to_string();
        summary.model_name = inner.model.model_name().to_string();
        summary.max_steps_configured = inner.options.max_steps;
        summary.max_steps_used = self.step_budget;
        summary.memory_enabled = inner.options.memory_enabled;
        summary.manage_lifecycle = self.manage;
        summary.external_history_used = self.options.external_history.is_some();

        if let Some(exec) = &self.exec {
            let available = exec.graph().snapshot().names();
            summary.tools_available_count = available.len();
            summary.tools_available_names = available;
            summary.steps_taken = exec.steps_taken();
            summary.tools_used_count = exec.tools_used().len();
            summary.tools_used_names = exec.tools_used().to_vec();
            summary.restarts = exec.restart_count();
        }

        if success {
            summary.response = self.final_output.as_ref().map(|text| match self.method {
                ExecutionMethod::StreamEvents => {
                    ExecutionSummary::streamed_response_marker(text.chars().count())
                }
                _ => text.clone(),
            });
        }
        summary.execution_time_ms = self.started.elapsed().as_millis() as u64;
        summary.error_type = error_type.map(str::to_string);
        summary.conversation_history_length = if inner.options.memory_enabled {
            self.agent.state().history.len()
        } else {
            0
        };

        mcpagent_telemetry::report(inner.reporter.as_ref(), &summary);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Phase::Extracting { handle, .. } = &self.phase {
            handle.abort();
        }
        if !self.reported {
            debug!(method = %self.method, "Execution dropped before completion");
            self.report(false, Some("cancelled"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_event::AgentStep;
    use crate::test_helpers::*;
    use crate::toolbox::{ACTIVATE_GROUP_TOOL, ToolGroupManager};
    use async_trait::async_trait;
    use mcpagent_core::{ProviderError, Role, Tool, ToolDescriptor, ToolError, ToolRegistry, ToolResult};
    use mcpagent_telemetry::{BackgroundReporter, MemoryReporter, TelemetryError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry wrapper that counts lifecycle calls.
    #[derive(Default)]
    struct TrackedTools {
        registry: ToolRegistry,
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    #[async_trait]
    impl ToolProvider for TrackedTools {
        fn list(&self) -> Vec<ToolDescriptor> {
            self.registry.list()
        }

        async fn invoke(
            &self,
            name: &str,
            arguments: serde_json::Value,
        ) -> Result<ToolResult, ToolError> {
            self.registry.invoke(name, arguments).await
        }

        async fn connect(&self) -> Result<(), ToolError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), ToolError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn weather_schema() -> OutputSchema {
        OutputSchema::from_value(serde_json::json!({
            "title": "Weather",
            "type": "object",
            "properties": {
                "city": {"type": "string", "description": "City name"},
                "temperature": {"type": "number"}
            },
            "required": ["city", "temperature"]
        }))
    }

    fn agent_with(
        model: Arc<ScriptedModel>,
        tools: Arc<dyn ToolProvider>,
        reporter: Arc<MemoryReporter>,
        options: AgentOptions,
    ) -> Agent {
        Agent::builder(model, tools)
            .reporter(reporter)
            .options(options)
            .build()
    }

    #[tokio::test]
    async fn plain_question_without_tools() {
        let model = Arc::new(ScriptedModel::new(vec![text("Paris.")]));
        let reporter = Arc::new(MemoryReporter::new(10));
        let agent = agent_with(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            reporter.clone(),
            AgentOptions::default(),
        );

        let outcome = agent.run("Capital of France?", RunOptions::new()).await.unwrap();

        assert_eq!(outcome.output, "Paris.");
        assert_eq!(outcome.steps, 0);
        assert_eq!(outcome.restarts, 0);
        assert!(outcome.structured.is_none());

        let history = agent.conversation_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].text(), "Capital of France?");
        assert_eq!(history[1].text(), "Paris.");

        let summary = &reporter.summaries()[0];
        assert!(summary.success);
        assert_eq!(summary.execution_method, ExecutionMethod::Run);
        assert_eq!(summary.response.as_deref(), Some("Paris."));
        assert_eq!(summary.model_provider, "scripted");
        assert_eq!(summary.conversation_history_length, 2);
    }

    #[tokio::test]
    async fn memory_carries_prior_turns() {
        let model = Arc::new(ScriptedModel::new(vec![text("Hi Ada."), text("Your name is Ada.")]));
        let agent = agent_with(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(MemoryReporter::new(10)),
            AgentOptions::default(),
        );

        agent.run("I am Ada", RunOptions::new()).await.unwrap();
        agent.run("What is my name?", RunOptions::new()).await.unwrap();

        let second = &model.requests()[1];
        let texts: Vec<_> = second.messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["I am Ada", "Hi Ada.", "What is my name?"]);

        agent.clear_conversation_history();
        assert!(agent.conversation_history().is_empty());
    }

    #[tokio::test]
    async fn memory_disabled_keeps_no_history() {
        let model = Arc::new(ScriptedModel::new(vec![text("one"), text("two")]));
        let options = AgentOptions {
            memory_enabled: false,
            ..AgentOptions::default()
        };
        let reporter = Arc::new(MemoryReporter::new(10));
        let agent = agent_with(model.clone(), Arc::new(ToolRegistry::new()), reporter.clone(), options);

        agent.run("first", RunOptions::new()).await.unwrap();
        agent.run("second", RunOptions::new()).await.unwrap();

        assert!(agent.conversation_history().is_empty());
        assert_eq!(model.requests()[1].messages.len(), 1);
        assert_eq!(reporter.summaries()[1].conversation_history_length, 0);
    }

    #[tokio::test]
    async fn external_history_is_seeded_first() {
        let model = Arc::new(ScriptedModel::new(vec![text("ok")]));
        let agent = agent_with(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(MemoryReporter::new(10)),
            AgentOptions::default(),
        );
        let external = vec![Message::user("earlier"), Message::assistant("noted")];

        agent
            .run("now", RunOptions::new().external_history(external))
            .await
            .unwrap();

        let texts: Vec<_> = model.requests()[0].messages.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["earlier", "noted", "now"]);
    }

    #[tokio::test]
    async fn uninitialized_agent_without_lifecycle_management_fails() {
        let model = Arc::new(ScriptedModel::new(vec![text("ok")]));
        let reporter = Arc::new(MemoryReporter::new(10));
        let agent = agent_with(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            reporter.clone(),
            AgentOptions::default(),
        );

        let err = agent
            .run("q", RunOptions::new().manage_lifecycle(false))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotInitialized));
        assert_eq!(model.call_count(), 0);
        assert_eq!(reporter.summaries()[0].error_type.as_deref(), Some("not_initialized"));

        agent.initialize().await.unwrap();
        let outcome = agent
            .run("q", RunOptions::new().manage_lifecycle(false))
            .await
            .unwrap();
        assert_eq!(outcome.output, "ok");
        assert!(agent.is_initialized());
    }

    #[tokio::test]
    async fn managed_lifecycle_connects_and_closes() {
        let tools = Arc::new(TrackedTools::default());
        let model = Arc::new(ScriptedModel::new(vec![text("a"), text("b")]));
        let agent = agent_with(
            model,
            tools.clone(),
            Arc::new(MemoryReporter::new(10)),
            AgentOptions::default(),
        );

        agent.run("q", RunOptions::new()).await.unwrap();
        assert_eq!(tools.connects.load(Ordering::SeqCst), 1);
        assert_eq!(tools.closes.load(Ordering::SeqCst), 1);
        assert!(!agent.is_initialized());

        // Initialized by the caller: the run leaves the connection open
        agent.initialize().await.unwrap();
        agent.run("q", RunOptions::new()).await.unwrap();
        assert_eq!(tools.connects.load(Ordering::SeqCst), 2);
        assert_eq!(tools.closes.load(Ordering::SeqCst), 1);
        assert!(agent.is_initialized());
    }

    #[tokio::test]
    async fn model_failure_tears_down_and_reports() {
        let tools = Arc::new(TrackedTools::default());
        let model = Arc::new(ScriptedModel::new(vec![fail(ProviderError::Network(
            "unreachable".into(),
        ))]));
        let reporter = Arc::new(MemoryReporter::new(10));
        let agent = agent_with(model, tools.clone(), reporter.clone(), AgentOptions::default());

        let err = agent.run("q", RunOptions::new()).await.unwrap_err();

        assert!(matches!(err, AgentError::Model(_)));
        assert_eq!(tools.closes.load(Ordering::SeqCst), 1);
        let summary = &reporter.summaries()[0];
        assert!(!summary.success);
        assert_eq!(summary.error_type.as_deref(), Some("model_error"));
        assert!(summary.response.is_none());
    }

    #[tokio::test]
    async fn stream_yields_calls_then_steps_then_final() {
        let tools = Arc::new(TrackedTools::default());
        tools
            .registry
            .register(FnTool::new("lookup", |_| Ok(ToolResult::ok("21C"))));
        let model = Arc::new(ScriptedModel::new(vec![
            calls(vec![call("lookup", serde_json::json!({"city": "Paris"}))]),
            text("It is 21C in Paris."),
        ]));
        let reporter = Arc::new(MemoryReporter::new(10));
        let agent = agent_with(model, tools, reporter.clone(), AgentOptions::default());

        let items: Vec<StreamItem> = agent
            .stream("Weather in Paris?", RunOptions::new())
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert!(matches!(&items[0], StreamItem::ToolCall(a) if a.tool == "lookup"));
        match &items[1] {
            StreamItem::Step(AgentStep { action, observation }) => {
                assert_eq!(action.tool_input["city"], "Paris");
                assert_eq!(observation.as_deref(), Some("21C"));
            }
            other => panic!("expected step, got {other:?}"),
        }
        assert_eq!(items[2], StreamItem::Final("It is 21C in Paris.".into()));

        let summary = &reporter.summaries()[0];
        assert_eq!(summary.execution_method, ExecutionMethod::Stream);
        assert_eq!(summary.steps_taken, 1);
        assert_eq!(summary.tools_used_names, vec!["lookup".to_string()]);
        assert_eq!(summary.tools_available_names, vec!["lookup".to_string()]);
    }

    #[tokio::test]
    async fn reasoning_plan_comes_first() {
        let model = Arc::new(ScriptedModel::new(vec![text("1. Answer directly."), text("42")]));
        let agent = agent_with(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(MemoryReporter::new(10)),
            AgentOptions::default(),
        );

        let items: Vec<StreamItem> = agent
            .stream("Meaning of life?", RunOptions::new().reasoning(true))
            .map(|item| item.unwrap())
            .collect()
            .await;

        assert!(matches!(&items[0], StreamItem::Plan(p) if p.contains("1. Answer directly.")));
        assert_eq!(items.last(), Some(&StreamItem::Final("42".into())));
        assert!(agent.reasoning_plan().unwrap().contains("REASONING PLAN"));
        assert!(model.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn run_without_reasoning_clears_earlier_plan() {
        let model = Arc::new(ScriptedModel::new(vec![
            text("1. Answer directly."),
            text("42"),
            text("43"),
        ]));
        let agent = agent_with(
            model,
            Arc::new(ToolRegistry::new()),
            Arc::new(MemoryReporter::new(10)),
            AgentOptions::default(),
        );

        agent
            .run("Meaning of life?", RunOptions::new().reasoning(true))
            .await
            .unwrap();
        assert!(agent.reasoning_plan().is_some());

        let outcome = agent.run("And now?", RunOptions::new()).await.unwrap();
        assert_eq!(outcome.output, "43");
        assert!(agent.reasoning_plan().is_none());
    }

    #[tokio::test]
    async fn dropped_stream_reports_cancelled() {
        let tools = Arc::new(TrackedTools::default());
        tools
            .registry
            .register(FnTool::new("slow", |_| Ok(ToolResult::ok("done"))));
        let model = Arc::new(ScriptedModel::new(vec![
            calls(vec![call("slow", serde_json::json!({}))]),
            text("finished"),
        ]));
        let reporter = Arc::new(MemoryReporter::new(10));
        let agent = agent_with(model, tools, reporter.clone(), AgentOptions::default());

        {
            let mut stream = agent.stream("q", RunOptions::new());
            let first = stream.next().await.unwrap().unwrap();
            assert!(matches!(first, StreamItem::ToolCall(_)));
        }

        let summaries = reporter.summaries();
        assert_eq!(summaries.len(), 1);
        assert!(!summaries[0].success);
        assert_eq!(summaries[0].error_type.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn structured_run_enhances_query_and_records_result() {
        let model = Arc::new(
            ScriptedModel::new(vec![text("Paris is at 21 degrees.")])
                .with_structured(vec![r#"{"city": "Paris", "temperature": 21}"#]),
        );
        let agent = agent_with(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(MemoryReporter::new(10)),
            AgentOptions::default(),
        );

        let outcome = agent
            .run("Weather in Paris?", RunOptions::new().output_schema(weather_schema()))
            .await
            .unwrap();

        assert_eq!(outcome.output, "Paris is at 21 degrees.");
        assert_eq!(outcome.structured.unwrap()["temperature"], 21);

        let sent = model.requests()[0].messages[0].text();
        assert!(sent.starts_with("Weather in Paris?"));
        assert!(sent.contains("- city: City name (required)"));

        let history = agent.conversation_history();
        assert_eq!(history[0].text(), "Weather in Paris?");
        assert!(history.last().unwrap().text().starts_with("Structured result: "));
        assert_eq!(history.last().unwrap().role, Role::Assistant);
    }

    #[tokio::test]
    async fn failed_extraction_keeps_free_text() {
        let model = Arc::new(
            ScriptedModel::new(vec![text("No idea about the weather.")])
                .with_structured(vec![r#"{"city": ""}"#, r#"{"city": ""}"#]),
        );
        let options = AgentOptions {
            structured_max_attempts: 2,
            ..AgentOptions::default()
        };
        let reporter = Arc::new(MemoryReporter::new(10));
        let agent = agent_with(model, Arc::new(ToolRegistry::new()), reporter.clone(), options);

        let err = agent
            .run("Weather?", RunOptions::new().output_schema(weather_schema()))
            .await
            .unwrap_err();

        assert_eq!(err.final_output(), Some("No idea about the weather."));
        match err {
            AgentError::Extraction { error, .. } => assert_eq!(error.attempts, 2),
            other => panic!("expected extraction error, got {other:?}"),
        }
        assert_eq!(
            reporter.summaries()[0].error_type.as_deref(),
            Some("structured_output_error")
        );
    }

    #[tokio::test]
    async fn exhausted_budget_yields_placeholder_output() {
        let tools = Arc::new(TrackedTools::default());
        tools
            .registry
            .register(FnTool::new("loop", |_| Ok(ToolResult::ok("again"))));
        let model = Arc::new(ScriptedModel::new(vec![
            calls(vec![call("loop", serde_json::json!({}))]),
            calls(vec![call("loop", serde_json::json!({}))]),
        ]));
        let agent = agent_with(
            model.clone(),
            tools,
            Arc::new(MemoryReporter::new(10)),
            AgentOptions::default(),
        );

        let outcome = agent.run("q", RunOptions::new().max_steps(2)).await.unwrap();
        assert_eq!(outcome.output, NO_OUTPUT);
        assert_eq!(outcome.steps, 2);
        assert_eq!(model.call_count(), 2);
        // Only the user message is remembered without an answer
        assert_eq!(agent.conversation_history().len(), 1);
    }

    #[tokio::test]
    async fn events_stream_tokens_tools_and_done() {
        let tools = Arc::new(TrackedTools::default());
        tools
            .registry
            .register(FnTool::new("count", |_| Ok(ToolResult::ok("3"))));
        let model = Arc::new(ScriptedModel::new(vec![
            calls_with_text("Counting first.", vec![call("count", serde_json::json!({}))]),
            text("There are 3 words."),
        ]));
        let reporter = Arc::new(MemoryReporter::new(10));
        let agent = agent_with(model, tools, reporter.clone(), AgentOptions::default());

        let events: Vec<AgentEvent> = agent
            .stream_events("How many words?", RunOptions::new())
            .map(|e| e.unwrap())
            .collect()
            .await;

        let kinds: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert!(kinds.contains(&"token"));
        let start = kinds.iter().position(|k| *k == "tool_start").unwrap();
        let end = kinds.iter().position(|k| *k == "tool_end").unwrap();
        assert!(start < end);
        assert_eq!(kinds.last(), Some(&"done"));

        match events.last().unwrap() {
            AgentEvent::Done { output, steps, .. } => {
                assert_eq!(output, "There are 3 words.");
                assert_eq!(*steps, 1);
            }
            other => panic!("expected done, got {other:?}"),
        }

        let summary = &reporter.summaries()[0];
        assert_eq!(summary.execution_method, ExecutionMethod::StreamEvents);
        assert_eq!(
            summary.response.as_deref(),
            Some("[STREAMED RESPONSE - 18 chars]")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_extraction_emits_heartbeats() {
        let model = Arc::new(
            ScriptedModel::new(vec![text("Oslo, 4 degrees.")])
                .with_structured(vec![r#"{"city": "Oslo", "temperature": 4}"#])
                .with_structured_delay(Duration::from_secs(5)),
        );
        let agent = agent_with(
            model,
            Arc::new(ToolRegistry::new()),
            Arc::new(MemoryReporter::new(10)),
            AgentOptions::default(),
        );

        let events: Vec<AgentEvent> = agent
            .stream_events("Weather in Oslo?", RunOptions::new().output_schema(weather_schema()))
            .map(|e| e.unwrap())
            .collect()
            .await;

        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::StructuredProgress { elapsed_ms } => Some(*elapsed_ms),
                _ => None,
            })
            .collect();
        assert!(progress.len() >= 2, "got {progress:?}");
        assert!(progress.windows(2).all(|w| w[0] < w[1]));

        let output_pos = events
            .iter()
            .position(|e| matches!(e, AgentEvent::StructuredOutput { .. }))
            .unwrap();
        let last_progress = events
            .iter()
            .rposition(|e| matches!(e, AgentEvent::StructuredProgress { .. }))
            .unwrap();
        assert!(last_progress < output_pos);
        assert!(matches!(events.last(), Some(AgentEvent::Done { .. })));
    }

    #[tokio::test]
    async fn group_activation_restarts_with_new_tools() {
        let manager = Arc::new(ToolGroupManager::new().with_group(
            "clock",
            "Time utilities",
            vec![FnTool::new("now", |_| Ok(ToolResult::ok("12:00"))) as Arc<dyn Tool>],
        ));
        let model = Arc::new(ScriptedModel::new(vec![
            calls(vec![call(ACTIVATE_GROUP_TOOL, serde_json::json!({"group": "clock"}))]),
            calls(vec![call("now", serde_json::json!({}))]),
            text("It is noon."),
        ]));
        let reporter = Arc::new(MemoryReporter::new(10));
        let options = AgentOptions {
            manage_lifecycle: false,
            ..AgentOptions::default()
        };
        let agent = agent_with(model.clone(), manager, reporter.clone(), options);
        agent.initialize().await.unwrap();
        assert!(agent.system_prompt().unwrap().contains("activate_tool_group"));

        let events: Vec<AgentEvent> = agent
            .stream_events("What time is it?", RunOptions::new())
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::Restarted { restart: 1, tools } if tools.contains(&"now".to_string())
        )));
        let second_call_tools: Vec<_> =
            model.requests()[1].tools.iter().map(|t| t.name.clone()).collect();
        assert!(second_call_tools.contains(&"now".to_string()));

        let summary = &reporter.summaries()[0];
        assert_eq!(summary.restarts, 1);
        assert_eq!(summary.steps_taken, 2);
        assert_eq!(
            agent.tools_used_names(),
            vec![ACTIVATE_GROUP_TOOL.to_string(), "now".to_string()]
        );
    }

    #[tokio::test]
    async fn disallowed_tools_are_hidden_from_the_model() {
        let tools = Arc::new(TrackedTools::default());
        tools.registry.register(FnTool::new("safe", |_| Ok(ToolResult::ok(""))));
        tools.registry.register(FnTool::new("shell", |_| Ok(ToolResult::ok(""))));
        let model = Arc::new(ScriptedModel::new(vec![text("ok")]));
        let options = AgentOptions {
            disallowed_tools: vec!["shell".into()],
            ..AgentOptions::default()
        };
        let agent = agent_with(model.clone(), tools, Arc::new(MemoryReporter::new(10)), options);

        agent.run("q", RunOptions::new()).await.unwrap();

        let offered: Vec<_> = model.requests()[0].tools.iter().map(|t| t.name.clone()).collect();
        assert_eq!(offered, vec!["safe".to_string()]);
        assert_eq!(agent.disallowed_tools(), vec!["shell".to_string()]);
    }

    #[tokio::test]
    async fn disallowed_tools_apply_to_the_next_run() {
        let tools = Arc::new(TrackedTools::default());
        tools.registry.register(FnTool::new("safe", |_| Ok(ToolResult::ok(""))));
        tools.registry.register(FnTool::new("shell", |_| Ok(ToolResult::ok(""))));
        let model = Arc::new(ScriptedModel::new(vec![text("first"), text("second")]));
        let agent = agent_with(
            model.clone(),
            tools,
            Arc::new(MemoryReporter::new(10)),
            AgentOptions {
                manage_lifecycle: false,
                ..AgentOptions::default()
            },
        );
        agent.initialize().await.unwrap();

        agent.run("q", RunOptions::new()).await.unwrap();
        agent.set_disallowed_tools(vec!["shell".into()]);
        agent.run("q", RunOptions::new()).await.unwrap();

        let offered = |i: usize| -> Vec<String> {
            model.requests()[i].tools.iter().map(|t| t.name.clone()).collect()
        };
        assert_eq!(offered(0), vec!["safe".to_string(), "shell".to_string()]);
        assert_eq!(offered(1), vec!["safe".to_string()]);
    }

    /// Holds every summary until released.
    struct GatedReporter {
        gate: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
        inner: MemoryReporter,
    }

    impl TelemetryReporter for GatedReporter {
        fn record(&self, summary: &ExecutionSummary) -> Result<(), TelemetryError> {
            let _ = self.gate.lock().unwrap().recv();
            self.inner.record(summary)
        }
    }

    #[tokio::test]
    async fn slow_reporter_does_not_hold_up_the_run() {
        let (release, gate) = std::sync::mpsc::channel();
        let slow = Arc::new(GatedReporter {
            gate: std::sync::Mutex::new(gate),
            inner: MemoryReporter::new(10),
        });
        let agent = Agent::builder(
            Arc::new(ScriptedModel::new(vec![text("done")])),
            Arc::new(ToolRegistry::new()),
        )
        .reporter(Arc::new(BackgroundReporter::spawn(slow.clone(), 8)))
        .build();

        let outcome = agent.run("q", RunOptions::new()).await.unwrap();
        assert_eq!(outcome.output, "done");
        assert!(slow.inner.is_empty());

        release.send(()).unwrap();
        for _ in 0..200 {
            if !slow.inner.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(slow.inner.summaries()[0].query, "q");
        drop(agent);
    }

    #[tokio::test]
    async fn set_system_prompt_rebuilds_initialized_graph() {
        let model = Arc::new(ScriptedModel::new(vec![text("Arr.")]));
        let agent = agent_with(
            model.clone(),
            Arc::new(ToolRegistry::new()),
            Arc::new(MemoryReporter::new(10)),
            AgentOptions {
                manage_lifecycle: false,
                ..AgentOptions::default()
            },
        );
        assert!(agent.system_prompt().is_none());

        agent.initialize().await.unwrap();
        agent.set_system_prompt("You are a pirate.");
        assert_eq!(agent.system_prompt().as_deref(), Some("You are a pirate."));

        agent.run("Hello", RunOptions::new()).await.unwrap();
        assert_eq!(
            model.requests()[0].system_prompt.as_deref(),
            Some("You are a pirate.")
        );
    }

    #[test]
    fn options_follow_config() {
        let mut config = AgentConfig::default();
        config.agent.max_steps = 9;
        config.agent.disallowed_tools = vec!["x".into()];
        config.structured_output.heartbeat_interval_ms = 500;
        let options = AgentOptions::from_config(&config);
        assert_eq!(options.max_steps, 9);
        assert_eq!(options.disallowed_tools, vec!["x".to_string()]);
        assert_eq!(options.heartbeat_interval, Duration::from_millis(500));
    }
}
