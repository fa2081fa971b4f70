//! Completion provider trait — the narrow capability the orchestrator calls.
//!
//! The orchestrator holds a provider by composition; it never wraps or extends
//! a concrete client type.

use crate::BoxFuture;

use super::types::{ChatRequest, ChatResponse, CompletionRequest, CompletionResponse};

/// Errors from completion provider calls.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    Request(String),

    #[error("authentication failed (check API key): {0}")]
    Auth(String),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("context length exceeded: {0}")]
    ContextLength(String),

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("provider error: {status} — {message}")]
    ProviderError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout")]
    Timeout,
}

/// Core trait for completion providers.
///
/// Implementations must be `Send + Sync`; `BoxFuture` keeps the trait
/// object-safe (`Arc<dyn CompletionProvider>`).
pub trait CompletionProvider: Send + Sync {
    /// Provider display name (e.g. "OpenAI").
    fn name(&self) -> &str;

    /// Single-prompt completion. May return zero choices.
    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<CompletionResponse, LlmError>>;

    /// Chat completion over a role-tagged message list. May return zero choices.
    fn chat<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ChatResponse, LlmError>>;
}
