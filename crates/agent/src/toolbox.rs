//! Tool groups — a [`ToolProvider`] whose tool set grows at runtime.
//!
//! Only two management tools are visible at first. The model lists the
//! groups and activates the ones it needs; an activated group's tools join
//! the set, which the execution loop picks up at its next safe point.

use async_trait::async_trait;
use mcpagent_core::{Tool, ToolDescriptor, ToolError, ToolProvider, ToolResult};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub const LIST_GROUPS_TOOL: &str = "list_tool_groups";
pub const ACTIVATE_GROUP_TOOL: &str = "activate_tool_group";

struct ToolGroup {
    description: String,
    tools: Vec<Arc<dyn Tool>>,
}

/// Named groups of tools, activated on demand.
#[derive(Default)]
pub struct ToolGroupManager {
    groups: BTreeMap<String, ToolGroup>,
    active: RwLock<BTreeSet<String>>,
}

impl ToolGroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group (inactive).
    pub fn with_group(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> Self {
        self.groups.insert(
            name.into(),
            ToolGroup {
                description: description.into(),
                tools,
            },
        );
        self
    }

    /// Activate a group. Returns `false` if it was already active.
    pub fn activate(&self, name: &str) -> Result<bool, ToolError> {
        if !self.groups.contains_key(name) {
            return Err(ToolError::NotFound(format!("tool group '{name}'")));
        }
        let newly = self
            .active
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        if newly {
            info!(group = name, "Activated tool group");
        }
        Ok(newly)
    }

    pub fn active_groups(&self) -> Vec<String> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active.iter().cloned().collect()
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    fn active_tools(&self) -> Vec<Arc<dyn Tool>> {
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        active
            .iter()
            .filter_map(|name| self.groups.get(name))
            .flat_map(|group| group.tools.iter().cloned())
            .collect()
    }

    fn describe_groups(&self) -> String {
        if self.groups.is_empty() {
            return "No tool groups configured.".into();
        }
        let active = self.active.read().unwrap_or_else(|e| e.into_inner());
        self.groups
            .iter()
            .map(|(name, group)| {
                let tools: Vec<&str> = group.tools.iter().map(|t| t.name()).collect();
                format!(
                    "- {name}{}: {} (tools: {})",
                    if active.contains(name) { " [active]" } else { "" },
                    group.description,
                    tools.join(", ")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn management_tools() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor {
                name: LIST_GROUPS_TOOL.into(),
                description: "List the available tool groups and whether each is active.".into(),
                input_schema: serde_json::json!({"type": "object", "properties": {}}),
            },
            ToolDescriptor {
                name: ACTIVATE_GROUP_TOOL.into(),
                description: "Activate a tool group so its tools become available.".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "group": {"type": "string", "description": "Name of the group to activate"}
                    },
                    "required": ["group"]
                }),
            },
        ]
    }

    fn handle_activate(&self, arguments: &serde_json::Value) -> Result<ToolResult, ToolError> {
        let group = arguments
            .get("group")
            .and_then(|g| g.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("missing 'group'".into()))?;

        match self.activate(group) {
            Ok(true) => {
                let tools: Vec<String> = self
                    .groups
                    .get(group)
                    .map(|g| g.tools.iter().map(|t| t.name().to_string()).collect())
                    .unwrap_or_default();
                Ok(ToolResult::ok(format!(
                    "Activated group '{group}'. Its tools are now available: {}",
                    tools.join(", ")
                )))
            }
            Ok(false) => Ok(ToolResult::ok(format!("Group '{group}' is already active."))),
            Err(_) => Ok(ToolResult::failed(format!(
                "Unknown tool group '{group}'. Available groups: {}",
                self.group_names().join(", ")
            ))),
        }
    }
}

#[async_trait]
impl ToolProvider for ToolGroupManager {
    fn list(&self) -> Vec<ToolDescriptor> {
        let mut tools = Self::management_tools();
        tools.extend(self.active_tools().iter().map(|t| t.to_descriptor()));
        tools
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolResult, ToolError> {
        match name {
            LIST_GROUPS_TOOL => Ok(ToolResult::ok(self.describe_groups())),
            ACTIVATE_GROUP_TOOL => self.handle_activate(&arguments),
            _ => {
                let tool = self
                    .active_tools()
                    .into_iter()
                    .find(|t| t.name() == name)
                    .ok_or_else(|| ToolError::NotFound(name.to_string()))?;
                tool.execute(arguments).await
            }
        }
    }

    async fn close(&self) -> Result<(), ToolError> {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        debug!(groups = active.len(), "Deactivating tool groups");
        active.clear();
        Ok(())
    }

    fn is_managed(&self) -> bool {
        true
    }
}
