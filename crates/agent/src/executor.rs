//! The execution loop — drives graph runs and reconciles tool-set changes.
//!
//! ```text
//! INIT ──begin──▶ STREAMING ──stream ended──▶ DONE
//!                  │     ▲
//!   tool set changed     resume
//!                  ▼     │
//!                RECONCILING          (any) ──error──▶ FAILED
//! ```
//!
//! Reconciliation happens only at two points: before the first graph run
//! and right after a tool-result message. Each restart re-runs a freshly
//! built graph over the whole accumulated log, so nothing said before the
//! restart is lost.

use crate::error::AgentError;
use crate::graph::{ExecutionGraph, GraphBuilder, GraphEvent, GraphRun, NodeUpdate};
use crate::message_log::MessageLog;
use crate::stream_event::{AgentAction, AgentStep};
use mcpagent_core::{Message, MessageToolCall, Role};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopState {
    Init,
    Streaming,
    Reconciling,
    Done,
    Failed,
}

/// What happened, as input to [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopInput {
    Begin,
    ToolSetChanged,
    Resume,
    StreamEnded,
    Error,
}

/// The transition table. `None` marks an illegal transition.
pub fn transition(state: LoopState, input: LoopInput) -> Option<LoopState> {
    use LoopInput as I;
    use LoopState as S;
    match (state, input) {
        (S::Init, I::Begin) => Some(S::Streaming),
        (S::Streaming, I::ToolSetChanged) => Some(S::Reconciling),
        (S::Streaming, I::StreamEnded) => Some(S::Done),
        (S::Reconciling, I::Resume) => Some(S::Streaming),
        (S::Init | S::Streaming | S::Reconciling, I::Error) => Some(S::Failed),
        _ => None,
    }
}

/// Events surfaced by the loop.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    Token(String),
    ToolStart(MessageToolCall),
    ToolEnd {
        call: MessageToolCall,
        output: String,
        success: bool,
    },
    /// The model requested a tool call (step in flight).
    ToolCall(AgentAction),
    /// A tool returned (step observed).
    Step(AgentStep),
    /// A new graph run started after a tool-set change.
    Restarted { restart: usize, tools: Vec<String> },
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    /// Model calls allowed per graph run
    pub step_budget: usize,
    /// Restarts allowed per execution
    pub max_restarts: usize,
}

/// One execution: its message log, counters and the graph in use.
pub struct ExecutionLoop {
    builder: GraphBuilder,
    graph: Arc<ExecutionGraph>,
    settings: LoopSettings,
    state: LoopState,
    log: MessageLog,
    run: Option<GraphRun>,
    queue: VecDeque<LoopEvent>,
    pending_actions: HashMap<String, AgentAction>,
    steps_taken: usize,
    tools_used: Vec<String>,
    restart_count: usize,
    final_output: Option<String>,
    exhaustion_logged: bool,
}

impl ExecutionLoop {
    /// Prepare an execution over `seed`, starting from `graph`.
    pub fn new(
        builder: GraphBuilder,
        graph: Arc<ExecutionGraph>,
        seed: Vec<Message>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            builder,
            graph,
            settings,
            state: LoopState::Init,
            log: seed.into_iter().collect(),
            run: None,
            queue: VecDeque::new(),
            pending_actions: HashMap::new(),
            steps_taken: 0,
            tools_used: Vec::new(),
            restart_count: 0,
            final_output: None,
            exhaustion_logged: false,
        }
    }

    /// Advance to the next event. `None` once the loop is done or failed.
    pub async fn next(&mut self) -> Option<Result<LoopEvent, AgentError>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(Ok(event));
            }

            match self.state {
                LoopState::Init => {
                    self.reconcile_pre_run();
                    if let Err(e) = self.advance(LoopInput::Begin) {
                        return Some(Err(e));
                    }
                    self.start_run();
                }

                LoopState::Streaming => {
                    let Some(run) = self.run.as_mut() else {
                        return Some(Err(self.fail(AgentError::Internal(
                            "streaming without a graph run".into(),
                        ))));
                    };

                    match run.next().await {
                        None => {
                            self.run = None;
                            if let Err(e) = self.advance(LoopInput::StreamEnded) {
                                return Some(Err(e));
                            }
                            info!(
                                steps = self.steps_taken,
                                restarts = self.restart_count,
                                "Execution loop finished"
                            );
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Model call failed");
                            return Some(Err(self.fail(AgentError::Model(e))));
                        }
                        Some(Ok(GraphEvent::Token(t))) => return Some(Ok(LoopEvent::Token(t))),
                        Some(Ok(GraphEvent::ToolStart(call))) => {
                            return Some(Ok(LoopEvent::ToolStart(call)));
                        }
                        Some(Ok(GraphEvent::ToolEnd {
                            call,
                            output,
                            success,
                        })) => {
                            return Some(Ok(LoopEvent::ToolEnd {
                                call,
                                output,
                                success,
                            }));
                        }
                        Some(Ok(GraphEvent::Update(update))) => {
                            if let Err(e) = self.absorb(update) {
                                return Some(Err(e));
                            }
                        }
                    }
                }

                LoopState::Reconciling => {
                    self.restart_count += 1;
                    info!(
                        restart = self.restart_count,
                        max = self.settings.max_restarts,
                        messages = self.log.len(),
                        "Restarting execution with updated tools"
                    );
                    self.queue.push_back(LoopEvent::Restarted {
                        restart: self.restart_count,
                        tools: self.graph.snapshot().names(),
                    });
                    if let Err(e) = self.advance(LoopInput::Resume) {
                        return Some(Err(e));
                    }
                    self.start_run();
                }

                LoopState::Done | LoopState::Failed => return None,
            }
        }
    }

    /// Fold one node update into the log and queue its events.
    fn absorb(&mut self, update: NodeUpdate) -> Result<(), AgentError> {
        let NodeUpdate { stage, messages } = update;
        debug!(stage = %stage, messages = messages.len(), "Node update");

        for message in &messages {
            self.log.append(message.clone());
        }

        // Every call of the turn already ran; all of them get their step
        // before a restart takes effect.
        let mut restart = false;
        for message in messages {
            if message.has_tool_calls() {
                let log_text = message.content.text_spans("\n");
                for call in &message.tool_calls {
                    let action = AgentAction {
                        tool: call.name.clone(),
                        tool_input: call.arguments.clone(),
                        log: log_text.clone(),
                    };
                    self.steps_taken += 1;
                    self.tools_used.push(call.name.clone());
                    info!(
                        tool = %call.name,
                        input = %truncate_for_log(&call.arguments.to_string(), 100),
                        "Tool call"
                    );
                    self.pending_actions.insert(call.id.clone(), action.clone());
                    self.queue.push_back(LoopEvent::ToolCall(action));
                }
            }

            if message.role == Role::Tool {
                let observation = message.text();
                info!(result = %truncate_for_log(&observation, 100), "Tool result");

                let action = message
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| self.pending_actions.remove(id));
                if let Some(action) = action {
                    self.queue.push_back(LoopEvent::Step(AgentStep {
                        action,
                        observation: Some(observation),
                    }));
                }

                // Safe point
                if !restart && self.tool_set_changed() {
                    restart = true;
                }
            }

            if message.is_final_answer() {
                self.final_output = Some(message.text());
                info!("Agent finished with output");
            }
        }

        if restart {
            self.run = None;
            self.advance(LoopInput::ToolSetChanged)?;
        }
        Ok(())
    }

    fn reconcile_pre_run(&mut self) {
        let current = self.builder.snapshot();
        if !current.same_tools(self.graph.snapshot()) {
            info!(tools = ?current.names(), "Tools changed before execution, rebuilding graph");
            self.graph = self.builder.build(current);
        }
    }

    /// Re-check the tool set; on a change within the restart budget, swap
    /// in a rebuilt graph and report `true`.
    fn tool_set_changed(&mut self) -> bool {
        let current = self.builder.snapshot();
        if current.same_tools(self.graph.snapshot()) {
            return false;
        }

        if self.restart_count >= self.settings.max_restarts {
            if !self.exhaustion_logged {
                warn!(
                    max_restarts = self.settings.max_restarts,
                    tools = ?current.names(),
                    "Max restarts reached, continuing with current tools"
                );
                self.exhaustion_logged = true;
            }
            return false;
        }

        info!(tools = ?current.names(), "Tools changed during execution");
        self.graph = self.builder.build(current);
        true
    }

    fn start_run(&mut self) {
        self.run = Some(
            self.graph
                .run(self.log.messages().to_vec(), self.settings.step_budget),
        );
    }

    fn advance(&mut self, input: LoopInput) -> Result<(), AgentError> {
        match transition(self.state, input) {
            Some(next) => {
                debug!(from = ?self.state, to = ?next, input = ?input, "Loop transition");
                self.state = next;
                Ok(())
            }
            None => {
                let from = self.state;
                Err(self.fail(AgentError::Internal(format!(
                    "illegal loop transition from {from:?} on {input:?}"
                ))))
            }
        }
    }

    fn fail(&mut self, err: AgentError) -> AgentError {
        self.run = None;
        self.queue.clear();
        self.state = LoopState::Failed;
        err
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The flattened final answer, if the model produced one.
    pub fn final_output(&self) -> Option<&str> {
        self.final_output.as_deref()
    }

    /// Text of the last assistant message, used when no final answer exists.
    pub fn partial_output(&self) -> Option<String> {
        self.log
            .messages()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.text_spans("\n"))
            .filter(|t| !t.trim().is_empty())
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    pub fn tools_used(&self) -> &[String] {
        &self.tools_used
    }

    pub fn restart_count(&self) -> usize {
        self.restart_count
    }

    /// The graph in use (rebuilt wholesale on reconciliation).
    pub fn graph(&self) -> &Arc<ExecutionGraph> {
        &self.graph
    }
}

/// Flatten newlines and cap length for log lines.
pub(crate) fn truncate_for_log(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() > max {
        let kept: String = flat.chars().take(max.saturating_sub(3)).collect();
        format!("{kept}...")
    } else {
        flat
    }
}
