//! Language model implementations for mcpagent.
//!
//! All models implement the `mcpagent_core::LanguageModel` trait.

pub mod openai_compat;

use mcpagent_config::ProviderSettings;
use mcpagent_core::{LanguageModel, ProviderError};
use std::sync::Arc;

pub use openai_compat::OpenAiCompatProvider;

/// Build the configured language model.
pub fn from_config(settings: &ProviderSettings) -> Result<Arc<dyn LanguageModel>, ProviderError> {
    tracing::debug!(provider = %settings.name, model = %settings.model, "Building language model");
    Ok(Arc::new(OpenAiCompatProvider::from_settings(settings)?))
}
