//! The execution graph — one bounded round of reasoning and tool use.
//!
//! A graph is compiled from a tool snapshot and the system prompt derived
//! from it. It never changes after construction: when the tool set or the
//! prompt changes, a new graph is built.
//!
//! Running a graph yields a pull-based [`GraphRun`]. Each call to
//! [`GraphRun::next`] advances the run by one observable event: a token
//! delta, a tool starting or ending, or a node update carrying the messages
//! a stage produced. Nothing happens between two calls, which lets the
//! execution loop stop a run at a safe point without any tool running
//! ahead of its decision.

use crate::prompt::PromptConfig;
use crate::snapshot::ToolSnapshot;
use mcpagent_core::provider::ChunkReceiver;
use mcpagent_core::{
    LanguageModel, Message, MessageToolCall, ModelRequest, ProviderError, ToolProvider,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// The logical stage that produced a node update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// A model turn finished.
    Model,
    /// Every tool call of the previous model turn finished.
    Tools,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::Tools => write!(f, "tools"),
        }
    }
}

/// Messages produced by one stage.
#[derive(Debug, Clone)]
pub struct NodeUpdate {
    pub stage: Stage,
    pub messages: Vec<Message>,
}

/// One observable step of a graph run.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// A text delta from the model.
    Token(String),
    /// A tool call is about to be invoked.
    ToolStart(MessageToolCall),
    /// A tool call finished; `output` is what the model will see.
    ToolEnd {
        call: MessageToolCall,
        output: String,
        success: bool,
    },
    Update(NodeUpdate),
}

/// Everything needed to compile graphs: the collaborators and the prompt
/// policy. Cheap to clone.
#[derive(Clone)]
pub struct GraphBuilder {
    model: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolProvider>,
    prompt: PromptConfig,
    disallowed: Arc<[String]>,
}

impl GraphBuilder {
    pub fn new(model: Arc<dyn LanguageModel>, tools: Arc<dyn ToolProvider>) -> Self {
        Self {
            model,
            tools,
            prompt: PromptConfig::default(),
            disallowed: Arc::from(Vec::new()),
        }
    }

    pub fn with_prompt(mut self, prompt: PromptConfig) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_disallowed_tools(mut self, disallowed: Vec<String>) -> Self {
        self.disallowed = disallowed.into();
        self
    }

    /// Take a snapshot of the provider's tools under this builder's filter.
    pub fn snapshot(&self) -> ToolSnapshot {
        ToolSnapshot::take(self.tools.as_ref(), &self.disallowed)
    }

    /// Compile a graph (and its system prompt) for a snapshot.
    pub fn build(&self, snapshot: ToolSnapshot) -> Arc<ExecutionGraph> {
        let system_prompt = self.prompt.build(&snapshot, self.tools.is_managed());
        debug!(tools = snapshot.len(), "Built execution graph");
        Arc::new(ExecutionGraph {
            model: self.model.clone(),
            tools: self.tools.clone(),
            snapshot,
            system_prompt,
        })
    }

    pub fn model(&self) -> &Arc<dyn LanguageModel> {
        &self.model
    }

    pub fn tools(&self) -> &Arc<dyn ToolProvider> {
        &self.tools
    }
}

/// A compiled model-plus-tools unit.
pub struct ExecutionGraph {
    model: Arc<dyn LanguageModel>,
    tools: Arc<dyn ToolProvider>,
    snapshot: ToolSnapshot,
    system_prompt: String,
}

impl ExecutionGraph {
    /// The tool set baked into this graph.
    pub fn snapshot(&self) -> &ToolSnapshot {
        &self.snapshot
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Start a run over `messages`, capped at `step_budget` model calls.
    pub fn run(self: &Arc<Self>, messages: Vec<Message>, step_budget: usize) -> GraphRun {
        GraphRun {
            graph: self.clone(),
            transcript: messages,
            model_calls: 0,
            step_budget,
            phase: Phase::CallModel,
        }
    }
}

enum Phase {
    CallModel,
    Streaming {
        rx: ChunkReceiver,
        text: String,
        tool_calls: Vec<MessageToolCall>,
    },
    TurnComplete {
        text: String,
        tool_calls: Vec<MessageToolCall>,
    },
    RunTools {
        pending: VecDeque<MessageToolCall>,
        in_flight: Option<MessageToolCall>,
        results: Vec<Message>,
    },
    Finished,
}

/// An in-progress graph run. Dropping it abandons the run.
pub struct GraphRun {
    graph: Arc<ExecutionGraph>,
    transcript: Vec<Message>,
    model_calls: usize,
    step_budget: usize,
    phase: Phase,
}

impl GraphRun {
    /// Advance to the next event. `None` once the model gave a final answer
    /// or the step budget is spent.
    pub async fn next(&mut self) -> Option<Result<GraphEvent, ProviderError>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,

                Phase::CallModel => {
                    if self.model_calls >= self.step_budget {
                        debug!(budget = self.step_budget, "Step budget exhausted, ending graph run");
                        return None;
                    }
                    self.model_calls += 1;

                    let request = ModelRequest {
                        messages: self.transcript.clone(),
                        system_prompt: Some(self.graph.system_prompt.clone()),
                        tools: self.graph.snapshot.descriptors().to_vec(),
                        ..ModelRequest::default()
                    };

                    debug!(
                        call = self.model_calls,
                        budget = self.step_budget,
                        messages = request.messages.len(),
                        "Calling model"
                    );

                    match self.graph.model.respond(request).await {
                        Ok(rx) => {
                            self.phase = Phase::Streaming {
                                rx,
                                text: String::new(),
                                tool_calls: Vec::new(),
                            };
                        }
                        Err(e) => return Some(Err(e)),
                    }
                }

                Phase::Streaming {
                    mut rx,
                    mut text,
                    mut tool_calls,
                } => match rx.recv().await {
                    Some(Ok(chunk)) => {
                        tool_calls.extend(chunk.tool_calls);
                        let delta = chunk.content.filter(|c| !c.is_empty());
                        if let Some(delta) = &delta {
                            text.push_str(delta);
                        }

                        self.phase = if chunk.done {
                            Phase::TurnComplete { text, tool_calls }
                        } else {
                            Phase::Streaming {
                                rx,
                                text,
                                tool_calls,
                            }
                        };

                        if let Some(delta) = delta {
                            trace!(len = delta.len(), "Model token");
                            return Some(Ok(GraphEvent::Token(delta)));
                        }
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    // Sender gone without a terminal chunk
                    None => self.phase = Phase::TurnComplete { text, tool_calls },
                },

                Phase::TurnComplete { text, tool_calls } => {
                    let message = Message::assistant_with_tool_calls(text, tool_calls.clone());
                    self.transcript.push(message.clone());

                    self.phase = if tool_calls.is_empty() {
                        Phase::Finished
                    } else {
                        Phase::RunTools {
                            pending: tool_calls.into(),
                            in_flight: None,
                            results: Vec::new(),
                        }
                    };

                    return Some(Ok(GraphEvent::Update(NodeUpdate {
                        stage: Stage::Model,
                        messages: vec![message],
                    })));
                }

                Phase::RunTools {
                    mut pending,
                    in_flight,
                    mut results,
                } => match in_flight {
                    None => match pending.pop_front() {
                        Some(call) => {
                            self.phase = Phase::RunTools {
                                pending,
                                in_flight: Some(call.clone()),
                                results,
                            };
                            return Some(Ok(GraphEvent::ToolStart(call)));
                        }
                        None => {
                            self.transcript.extend(results.iter().cloned());
                            self.phase = Phase::CallModel;
                            return Some(Ok(GraphEvent::Update(NodeUpdate {
                                stage: Stage::Tools,
                                messages: results,
                            })));
                        }
                    },
                    Some(call) => {
                        let (output, success) = self.invoke(&call).await;
                        results.push(Message::tool_result(
                            call.id.clone(),
                            call.name.clone(),
                            output.clone(),
                        ));
                        self.phase = Phase::RunTools {
                            pending,
                            in_flight: None,
                            results,
                        };
                        return Some(Ok(GraphEvent::ToolEnd {
                            call,
                            output,
                            success,
                        }));
                    }
                },
            }
        }
    }

    /// Invoke one tool. Failures become result text for the model.
    async fn invoke(&self, call: &MessageToolCall) -> (String, bool) {
        if !self.graph.snapshot.contains(&call.name) {
            warn!(tool = %call.name, "Model requested a tool outside the current tool set");
            return (format!("Error: tool '{}' is not available", call.name), false);
        }

        match self.graph.tools.invoke(&call.name, call.arguments.clone()).await {
            Ok(result) => (result.output, result.success),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                (format!("Error: {e}"), false)
            }
        }
    }

    /// Model invocations made so far.
    pub fn model_calls(&self) -> usize {
        self.model_calls
    }

    /// The messages this run has seen and produced.
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }
}
