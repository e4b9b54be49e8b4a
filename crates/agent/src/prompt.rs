//! System prompt construction from a tool snapshot.

use crate::snapshot::ToolSnapshot;
use mcpagent_config::TOOL_DESCRIPTIONS_PLACEHOLDER;

/// Default template; `{tool_descriptions}` is replaced by the tool list.
pub const DEFAULT_SYSTEM_PROMPT_TEMPLATE: &str = "\
You are a helpful AI assistant with access to a set of tools.
Use a tool when it helps answer the user's request and answer directly when it does not.

You have access to the following tools:
{tool_descriptions}

Call tools one at a time when a later call depends on an earlier result.
When you have enough information, reply with the final answer.";

/// Template used when the tool provider manages tool groups.
pub const TOOL_GROUP_SYSTEM_PROMPT_TEMPLATE: &str = "\
You are a helpful AI assistant. Your tools are organised into groups that must be activated before use.

Use `list_tool_groups` to see the available groups and `activate_tool_group` to enable the one you need.
Tools from a newly activated group become available on your next turn.

Currently available tools:
{tool_descriptions}

When you have enough information, reply with the final answer.";

/// How the system prompt is derived.
#[derive(Debug, Clone, Default)]
pub struct PromptConfig {
    /// Full override; the tool list is not injected.
    pub system_prompt: Option<String>,

    /// Template override with a `{tool_descriptions}` placeholder.
    pub template: Option<String>,

    /// Appended after the rendered prompt.
    pub additional_instructions: Option<String>,
}

impl PromptConfig {
    /// Build the system prompt for a snapshot.
    ///
    /// `managed` selects the tool-group template when no override is set.
    pub fn build(&self, snapshot: &ToolSnapshot, managed: bool) -> String {
        let mut prompt = match (&self.system_prompt, &self.template) {
            (Some(full), _) => full.clone(),
            (None, Some(template)) => render(template, snapshot),
            (None, None) if managed => render(TOOL_GROUP_SYSTEM_PROMPT_TEMPLATE, snapshot),
            (None, None) => render(DEFAULT_SYSTEM_PROMPT_TEMPLATE, snapshot),
        };

        if let Some(extra) = self.additional_instructions.as_deref().filter(|s| !s.trim().is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(extra);
        }
        prompt
    }
}

fn render(template: &str, snapshot: &ToolSnapshot) -> String {
    template.replace(TOOL_DESCRIPTIONS_PLACEHOLDER, &describe_tools(snapshot))
}

/// One `- name: description` line per tool.
pub fn describe_tools(snapshot: &ToolSnapshot) -> String {
    if snapshot.is_empty() {
        return "No tools available.".into();
    }
    snapshot
        .descriptors()
        .iter()
        .map(|t| format!("- {}: {}", t.name, t.description))
        .collect::<Vec<_>>()
        .join("\n")
}
