//! Built-in tools, grouped for on-demand activation.

use async_trait::async_trait;
use mcpagent_agent::ToolGroupManager;
use mcpagent_core::{Tool, ToolError, ToolResult};
use std::sync::Arc;

/// The `clock` and `text` groups.
pub fn default_groups() -> ToolGroupManager {
    ToolGroupManager::new()
        .with_group(
            "clock",
            "Date and time utilities",
            vec![Arc::new(CurrentTimeTool) as Arc<dyn Tool>],
        )
        .with_group(
            "text",
            "Text analysis utilities",
            vec![Arc::new(WordCountTool) as Arc<dyn Tool>],
        )
}

pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC (RFC 3339)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let now = chrono::Utc::now();
        Ok(ToolResult {
            success: true,
            output: now.to_rfc3339(),
            data: Some(serde_json::json!({"unix": now.timestamp()})),
        })
    }
}

pub struct WordCountTool;

#[async_trait]
impl Tool for WordCountTool {
    fn name(&self) -> &str {
        "word_count"
    }

    fn description(&self) -> &str {
        "Count the words, lines and characters of a text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The text to analyse"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let text = arguments["text"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;

        let words = text.split_whitespace().count();
        let lines = text.lines().count();
        let chars = text.chars().count();
        Ok(ToolResult {
            success: true,
            output: format!("{words} words, {lines} lines, {chars} characters"),
            data: Some(serde_json::json!({"words": words, "lines": lines, "chars": chars})),
        })
    }
}
