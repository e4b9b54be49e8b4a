//! The bounded agent execution loop — the heart of mcpagent.
//!
//! An execution follows these steps:
//!
//! 1. **Snapshot** the tool provider's current tool set
//! 2. **Build** an immutable execution graph (system prompt + tools)
//! 3. **Run** the graph: model turn, tool calls in order, model turn, ...
//!    until a final answer or the step budget is spent
//! 4. **Reconcile** after every tool result: if the tool set changed,
//!    rebuild the graph and restart over the accumulated messages
//! 5. **Extract** a structured result from the final answer, if asked
//! 6. **Report** an execution summary, whatever the outcome
//!
//! [`Agent`] is the entry point; [`ExecutionLoop`] and [`ExecutionGraph`]
//! are usable on their own.

pub mod agent;
pub mod error;
pub mod executor;
pub mod graph;
pub mod message_log;
pub mod planner;
pub mod prompt;
pub mod snapshot;
pub mod stream_event;
pub mod structured;
pub mod toolbox;

#[cfg(test)]
pub mod test_helpers;

pub use agent::{Agent, AgentBuilder, AgentOptions, AgentOutcome, NO_OUTPUT, RunOptions};
pub use error::AgentError;
pub use executor::{ExecutionLoop, LoopEvent, LoopInput, LoopSettings, LoopState, transition};
pub use graph::{ExecutionGraph, GraphBuilder, GraphEvent, GraphRun, NodeUpdate, Stage};
pub use message_log::MessageLog;
pub use prompt::{DEFAULT_SYSTEM_PROMPT_TEMPLATE, PromptConfig, TOOL_GROUP_SYSTEM_PROMPT_TEMPLATE};
pub use snapshot::ToolSnapshot;
pub use stream_event::{AgentAction, AgentEvent, AgentStep, StreamItem};
pub use structured::{
    ExtractionError, OutputAttempt, OutputSchema, PartialJsonParser, StructuredOutputExtractor,
};
pub use toolbox::{ACTIVATE_GROUP_TOOL, LIST_GROUPS_TOOL, ToolGroupManager};
