//! `mcpagent run` — Run a query through the agent.

use crate::tools;
use clap::Args;
use futures::StreamExt;
use mcpagent_agent::{Agent, AgentError, AgentEvent, AgentOptions, OutputSchema, RunOptions, StreamItem};
use mcpagent_config::AgentConfig;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Args)]
pub struct RunArgs {
    /// The query to run
    pub query: String,

    /// Step budget for this run (overrides config)
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// JSON Schema file; the answer is extracted into this shape
    #[arg(long)]
    pub schema: Option<PathBuf>,

    /// Generate a reasoning plan before executing
    #[arg(long)]
    pub reasoning: bool,

    /// Print token-level events instead of steps
    #[arg(long)]
    pub events: bool,

    /// Do not keep conversation history
    #[arg(long)]
    pub no_memory: bool,
}

pub async fn run(config: AgentConfig, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    if !config.has_api_key() && config.provider.name != "ollama" {
        eprintln!("❌ No API key configured.");
        eprintln!("   Set MCPAGENT_API_KEY or run `mcpagent init` and edit the config.");
        return Err("missing API key".into());
    }

    let model = mcpagent_providers::from_config(&config.provider)?;
    let reporter = mcpagent_telemetry::from_settings(&config.telemetry);

    let mut options = AgentOptions::from_config(&config);
    if args.no_memory {
        options.memory_enabled = false;
    }

    let agent = Agent::builder(model, Arc::new(tools::default_groups()))
        .reporter(reporter)
        .options(options)
        .build();

    let mut run_options = RunOptions::new().reasoning(args.reasoning);
    if let Some(steps) = args.max_steps {
        run_options = run_options.max_steps(steps);
    }
    if let Some(path) = &args.schema {
        run_options = run_options.output_schema(load_schema(path)?);
    }

    tracing::debug!(model = %config.provider.model, "Running query");

    let result = if args.events {
        print_events(&agent, &args.query, run_options).await
    } else {
        print_steps(&agent, &args.query, run_options).await
    };

    match result {
        Ok(()) => Ok(()),
        Err(AgentError::Extraction { error, final_output }) => {
            eprintln!("⚠️  Structured output failed: {error}");
            println!("{final_output}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn load_schema(path: &Path) -> Result<OutputSchema, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read schema {}: {e}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| format!("Invalid JSON in schema {}: {e}", path.display()))?;
    Ok(OutputSchema::from_value(value))
}

async fn print_steps(agent: &Agent, query: &str, options: RunOptions) -> Result<(), AgentError> {
    let mut stream = agent.stream(query, options);
    while let Some(item) = stream.next().await {
        match item? {
            StreamItem::Plan(plan) => eprintln!("{plan}"),
            StreamItem::ToolCall(action) => {
                eprintln!("🔧 {}({})", action.tool, action.tool_input);
            }
            StreamItem::Step(step) => {
                if let Some(observation) = &step.observation {
                    eprintln!("   ↳ {observation}");
                }
            }
            StreamItem::Final(text) => println!("{text}"),
            StreamItem::Structured(value) => {
                println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            }
        }
    }
    Ok(())
}

async fn print_events(agent: &Agent, query: &str, options: RunOptions) -> Result<(), AgentError> {
    let mut stream = agent.stream_events(query, options);
    let mut stdout = std::io::stdout();
    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::Token { content } => {
                print!("{content}");
                let _ = stdout.flush();
            }
            AgentEvent::ToolStart { name, input, .. } => eprintln!("\n🔧 {name}({input})"),
            AgentEvent::ToolEnd { output, success, .. } => {
                let mark = if success { "↳" } else { "✗" };
                eprintln!("   {mark} {output}");
            }
            AgentEvent::Restarted { restart, tools } => {
                eprintln!("🔄 Tool set changed (restart {restart}): {}", tools.join(", "));
            }
            AgentEvent::StructuredProgress { elapsed_ms } => {
                eprintln!("⏳ Structuring output... {:.1}s", elapsed_ms as f64 / 1000.0);
            }
            AgentEvent::StructuredOutput { value } => {
                println!("\n{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            }
            AgentEvent::Done { steps, restarts, .. } => {
                println!();
                tracing::debug!(steps, restarts, "Run complete");
            }
        }
    }
    Ok(())
}
