//! Configuration loading, validation, and management for mcpagent.
//!
//! Loads configuration from `~/.mcpagent/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Placeholder a custom system prompt template must contain.
pub const TOOL_DESCRIPTIONS_PLACEHOLDER: &str = "{tool_descriptions}";

/// The root configuration structure.
///
/// Maps directly to `~/.mcpagent/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Language model connection settings
    #[serde(default)]
    pub provider: ProviderSettings,

    /// Execution loop settings
    #[serde(default)]
    pub agent: AgentSettings,

    /// Structured output extraction settings
    #[serde(default)]
    pub structured_output: StructuredOutputSettings,

    /// Execution summary reporting
    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

/// Redact a secret for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider label, reported in telemetry
    #[serde(default = "default_provider_name")]
    pub name: String,

    /// Base URL of an OpenAI-compatible API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whole-request timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider_name() -> String {
    "openai".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_timeout_secs() -> u64 {
    120
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            name: default_provider_name(),
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Maximum model turns per run
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// How many times a run may restart on a tool-set change
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,

    /// Keep the conversation across runs
    #[serde(default = "default_true")]
    pub memory_enabled: bool,

    /// Let a run connect and close the tool provider itself
    #[serde(default = "default_true")]
    pub manage_lifecycle: bool,

    /// Full system prompt override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Template with a `{tool_descriptions}` placeholder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt_template: Option<String>,

    /// Appended to the built system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,

    /// Tools never offered to the model
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
}

fn default_max_steps() -> usize {
    5
}
fn default_max_restarts() -> usize {
    3
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_restarts: default_max_restarts(),
            memory_enabled: true,
            manage_lifecycle: true,
            system_prompt: None,
            system_prompt_template: None,
            additional_instructions: None,
            disallowed_tools: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredOutputSettings {
    /// Formatting attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Progress event cadence while extraction is pending
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_heartbeat_interval_ms() -> u64 {
    2000
}

impl Default for StructuredOutputSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

/// Where execution summaries go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetrySink {
    /// Emit each summary as a structured log line
    Log,
    /// Keep summaries in a bounded in-process buffer
    Memory,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_sink")]
    pub sink: TelemetrySink,

    /// Capacity of the memory sink
    #[serde(default = "default_max_summaries")]
    pub max_summaries: usize,
}

fn default_sink() -> TelemetrySink {
    TelemetrySink::Log
}
fn default_max_summaries() -> usize {
    1000
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            sink: default_sink(),
            max_summaries: default_max_summaries(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the default path (~/.mcpagent/config.toml).
    ///
    /// Also checks environment variables:
    /// - `MCPAGENT_API_KEY` (highest priority), then `OPENAI_API_KEY`
    /// - `MCPAGENT_MODEL`
    /// - `MCPAGENT_BASE_URL`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_overrides(&Self::config_path())
    }

    /// Load from `path`, then apply environment overrides.
    pub fn load_with_overrides(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.provider.api_key.is_none() {
            self.provider.api_key = lookup("MCPAGENT_API_KEY").or_else(|| lookup("OPENAI_API_KEY"));
        }

        if let Some(model) = lookup("MCPAGENT_MODEL") {
            self.provider.model = model;
        }

        if let Some(base_url) = lookup("MCPAGENT_BASE_URL") {
            self.provider.base_url = base_url;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".mcpagent")
    }

    /// Get the default configuration file path.
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(ConfigError::ValidationError(
                "provider.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.provider.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "provider.base_url must not be empty".into(),
            ));
        }

        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_steps must be at least 1".into(),
            ));
        }

        if let Some(template) = &self.agent.system_prompt_template {
            if !template.contains(TOOL_DESCRIPTIONS_PLACEHOLDER) {
                return Err(ConfigError::ValidationError(format!(
                    "agent.system_prompt_template must contain {TOOL_DESCRIPTIONS_PLACEHOLDER}"
                )));
            }
        }

        if self.structured_output.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "structured_output.max_attempts must be at least 1".into(),
            ));
        }

        if self.structured_output.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "structured_output.heartbeat_interval_ms must be > 0".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.provider.api_key.is_some()
    }

    /// Generate a default config TOML string (for the `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
