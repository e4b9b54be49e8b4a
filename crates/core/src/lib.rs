//! # mcpagent Core
//!
//! Domain types, traits, and error definitions for the mcpagent runtime.
//! This crate has **zero framework dependencies** — it defines the domain model
//! that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! The two external collaborators of the agent loop are defined as traits here:
//! - [`LanguageModel`] — streams model turns and structured output
//! - [`ToolProvider`] — lists the current tool set and invokes tools
//!
//! Implementations live in their respective crates (or in tests), so the loop
//! can be driven by a real HTTP model or by a scripted one.

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, ToolError};
pub use message::{ContentPart, Message, MessageContent, MessageToolCall, Role};
pub use provider::{
    ChunkReceiver, DeltaReceiver, LanguageModel, ModelRequest, StreamChunk, StructuredRequest,
    Usage,
};
pub use tool::{Tool, ToolDescriptor, ToolProvider, ToolRegistry, ToolResult};
