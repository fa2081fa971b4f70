//! Errors surfaced by [`ConversationClient`](crate::ConversationClient).
//!
//! Failures before the provider call are wrapped in
//! [`ConversationError::Preprocess`], failures after it in
//! [`ConversationError::Postprocess`]. Provider errors pass through untouched.
//! Nothing here is retried; retry policy belongs to the caller.

use crate::llm::LlmError;
use crate::store::StoreError;

/// A failed pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The reserved completion size leaves no room for a prompt.
    #[error("max_tokens ({reserved}) must be less than the maximum context length ({limit})")]
    BudgetConfig { reserved: usize, limit: usize },

    #[error("create session failed: {0}")]
    Session(#[source] StoreError),

    #[error("create message failed: {0}")]
    MessagePersist(#[source] StoreError),

    #[error("provider returned no choices")]
    EmptyChoices,

    #[error("request has no user message")]
    NoUserMessage,
}

/// Errors from a context-managed completion.
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("preprocess failed: {0}")]
    Preprocess(#[source] PipelineError),

    #[error("postprocess failed: {0}")]
    Postprocess(#[source] PipelineError),

    /// The provider call itself failed. The user's turn stays persisted.
    #[error(transparent)]
    Completion(#[from] LlmError),

    #[error("close conversation failed: {0}")]
    Close(#[source] StoreError),
}

impl ConversationError {
    /// The failed stage, for pre- and post-processing errors.
    pub fn pipeline(&self) -> Option<&PipelineError> {
        match self {
            ConversationError::Preprocess(e) | ConversationError::Postprocess(e) => Some(e),
            _ => None,
        }
    }
}
