//! mcpagent CLI — the main entry point.
//!
//! Commands:
//! - `run`     — Run a query through the agent, streaming its steps
//! - `init`    — Write the default config file
//! - `config`  — Show the effective configuration

use clap::{Parser, Subcommand};
use mcpagent_config::{AgentConfig, ConfigError};
use std::path::{Path, PathBuf};

mod commands;
mod tools;

#[derive(Parser)]
#[command(
    name = "mcpagent",
    about = "mcpagent — a bounded tool-using agent loop",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file to use instead of ~/.mcpagent/config.toml
    #[arg(short, long, global = true, env = "MCPAGENT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a query
    Run(commands::run::RunArgs),

    /// Write the default configuration file
    Init,

    /// Show the effective configuration (secrets redacted)
    Config,
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig, ConfigError> {
    match path {
        Some(path) => AgentConfig::load_with_overrides(path),
        None => AgentConfig::load(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => {
            let config = load_config(cli.config.as_deref())
                .map_err(|e| format!("Failed to load config: {e}"))?;
            commands::run::run(config, args).await?
        }
        Commands::Init => commands::init::run(cli.config.as_deref()).await?,
        Commands::Config => {
            let config = load_config(cli.config.as_deref())
                .map_err(|e| format!("Failed to load config: {e}"))?;
            commands::config_cmd::show(&config)?
        }
    }

    Ok(())
}
