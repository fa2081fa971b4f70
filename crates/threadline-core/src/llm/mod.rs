//! Completion provider integration.
//!
//! The orchestrator talks to a model through the [`CompletionProvider`] trait.
//! Currently supported:
//!
//! - **OpenAI** — legacy completions and chat completions (also compatible with
//!   Ollama, vLLM, Together AI, and other OpenAI-compatible endpoints)
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐     ┌────────────────────┐
//! │ ConversationClient │────▶│ CompletionProvider │  (trait)
//! └────────────────────┘     └─────────┬──────────┘
//!                                      │
//!                          ┌───────────┴───────────┐
//!                          ▼                       ▼
//!                  ┌──────────────┐        ┌──────────────┐
//!                  │    OpenAI    │        │ test doubles │
//!                  └──────────────┘        └──────────────┘
//! ```

pub mod openai;
pub mod provider;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

pub use openai::OpenAiProvider;
pub use provider::{CompletionProvider, LlmError};
pub use types::*;

/// Create a completion provider from config.
///
/// Reads the `[llm]` section of the config to determine which provider to use
/// and how to authenticate. Fails when no API key can be resolved.
pub fn create_provider(
    config: &threadline_config::LlmConfig,
) -> Result<Arc<dyn CompletionProvider>, LlmError> {
    use threadline_config::LlmProviderKind;

    let api_key = config.resolve_api_key().ok_or_else(|| {
        LlmError::Auth(format!(
            "no API key configured (set llm.api_key or ${})",
            config.api_key_env
        ))
    })?;

    match config.provider {
        LlmProviderKind::OpenAi => {
            let mut provider = OpenAiProvider::new(api_key)
                .with_model(&config.model)
                .with_completion_model(&config.completion_model);
            if let Some(ref base_url) = config.base_url {
                provider = provider.with_base_url(base_url);
            }
            if config.timeout_secs > 0 {
                provider = provider.with_timeout(Duration::from_secs(config.timeout_secs));
            }
            Ok(Arc::new(provider))
        }
    }
}
