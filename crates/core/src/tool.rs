//! Tool traits — the abstraction over agent capabilities.
//!
//! A [`Tool`] is a single capability. A [`ToolProvider`] is whatever exposes
//! the *current* set of tools to the agent loop: the set may change between
//! two calls to [`ToolProvider::list`] (servers connecting, groups being
//! activated), which is why the loop works from snapshots of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use crate::error::ToolError;

/// What the model is told about a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// The tool name, unique within one tool set
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's arguments
    pub input_schema: serde_json::Value,
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            data: None,
        }
    }
}

/// A single capability the agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "search", "current_time").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError>;

    /// Describe this tool for a tool-set listing.
    fn to_descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.parameters_schema(),
        }
    }
}

/// The source of the agent's tool set.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    /// The tools available right now. Cheap; called at every safe point.
    fn list(&self) -> Vec<ToolDescriptor>;

    /// Invoke a tool by name.
    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError>;

    /// Establish any connections the tools need.
    async fn connect(&self) -> Result<(), ToolError> {
        Ok(())
    }

    /// Tear down connections established by [`connect`](Self::connect).
    async fn close(&self) -> Result<(), ToolError> {
        Ok(())
    }

    /// Whether this provider exposes management tools that change the set
    /// (used to pick the system prompt template).
    fn is_managed(&self) -> bool {
        false
    }
}

/// A registry of tools, mutable through a shared reference so that tools
/// can be added or removed while a run is in flight.
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.insert(name, tool);
    }

    /// Remove a tool by name. Returns whether it was present.
    pub fn unregister(&self, name: &str) -> bool {
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.get(name).cloned()
    }

    /// List all registered tool names, in name order.
    pub fn names(&self) -> Vec<String> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProvider for ToolRegistry {
    fn list(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools.values().map(|t| t.to_descriptor()).collect()
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        // Clone the handle out so the lock is not held across the await.
        let tool = self.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        tool.execute(arguments).await
    }
}
