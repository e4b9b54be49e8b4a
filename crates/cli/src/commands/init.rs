//! `mcpagent init` — Write the default configuration file.

use mcpagent_config::AgentConfig;
use std::path::Path;

pub async fn run(path: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(AgentConfig::config_path);

    if config_path.exists() {
        println!("⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or delete it and re-run init.");
        return Ok(());
    }

    if let Some(dir) = config_path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)?;
            println!("✅ Created config directory: {}", dir.display());
        }
    }

    std::fs::write(&config_path, AgentConfig::default_toml())?;
    println!("✅ Created config.toml at: {}", config_path.display());
    println!("\n📝 Next steps:");
    println!("   1. Set MCPAGENT_API_KEY (or OPENAI_API_KEY), or add api_key under [provider]");
    println!("   2. Run: mcpagent run \"What time is it?\"");
    Ok(())
}
