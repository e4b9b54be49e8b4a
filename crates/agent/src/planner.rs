//! Reasoning plans — a tool-free model call that outlines the approach
//! before execution starts.

use crate::prompt::describe_tools;
use crate::snapshot::ToolSnapshot;
use mcpagent_core::{LanguageModel, Message, ModelRequest};
use tracing::{info, warn};

fn banner(body: &str) -> String {
    let rule = "=".repeat(60);
    format!("{rule}\nREASONING PLAN\n{rule}\n{}\n{rule}", body.trim_end())
}

fn planning_prompt(query: &str, tool_info: &str) -> String {
    format!(
        "You are an AI assistant that needs to plan how to answer a user's query using the available tools.\n\n\
         User Query: {query}\n\n\
         Available Tools:\n{tool_info}\n\n\
         Please analyze the query and create a plan that specifies:\n\
         1. Which tools should be called\n\
         2. The order in which tools should be called\n\
         3. A brief explanation of why each tool is needed\n\n\
         Format your response as a clear, structured plan. Be specific about tool names."
    )
}

/// Ask the model for a plan. Never fails: on a model error the plan just
/// lists the available tools.
pub async fn generate_plan(model: &dyn LanguageModel, query: &str, snapshot: &ToolSnapshot) -> String {
    let tool_info = describe_tools(snapshot);
    let request = ModelRequest {
        messages: vec![Message::user(planning_prompt(query, &tool_info))],
        ..ModelRequest::default()
    };

    match model.complete(request).await {
        Ok(reply) => {
            let plan = banner(&reply.content.text_spans("\n"));
            info!(plan = %plan, "Generated reasoning plan");
            plan
        }
        Err(e) => {
            warn!(error = %e, "Failed to generate reasoning plan");
            banner(&format!(
                "Query: {query}\n\nAvailable Tools:\n{tool_info}\n\n\
                 Note: Automatic planning failed. The agent will proceed with available tools."
            ))
        }
    }
}
