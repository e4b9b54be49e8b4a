//! `mcpagent config` — Show the effective configuration.

use mcpagent_config::AgentConfig;

pub fn show(config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut shown = config.clone();
    if shown.provider.api_key.is_some() {
        shown.provider.api_key = Some("[REDACTED]".into());
    }

    println!("# {}", AgentConfig::config_path().display());
    println!("{}", toml::to_string_pretty(&shown)?);

    if !config.has_api_key() {
        println!("# ⚠️  No API key set (MCPAGENT_API_KEY or OPENAI_API_KEY)");
    }
    Ok(())
}
