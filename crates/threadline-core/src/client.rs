//! Session-aware completions — the request lifecycle around one provider call.
//!
//! ```text
//! caller ──▶ resolve/create session ──▶ build window ──▶ persist user turn
//!                                                              │
//! caller ◀── raw response ◀── persist paired reply ◀── provider call
//! ```
//!
//! Each call is independent: the client keeps no per-request state, so one
//! instance can serve concurrent callers behind an `Arc`. Concurrent requests
//! for the same user are not serialized; they may both resolve (or both
//! create) a session and interleave their writes.
//!
//! Dropping a request future cancels it at the next store or provider await.
//! Writes that already completed stay committed.

use std::future::Future;
use std::sync::Arc;

use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span, debug, info_span};

use threadline_config::ConversationConfig;

use crate::context::{WindowBudget, WindowBuilder, char_len};
use crate::error::{ConversationError, PipelineError};
use crate::llm::{
    ChatMessage, ChatRequest, ChatResponse, CompletionProvider, CompletionRequest,
    CompletionResponse, Role,
};
use crate::model::{Message, Session};
use crate::session::SessionLifecycle;
use crate::store::{ConversationStore, StoreError};

const DEFAULT_MAX_CONTEXT_LENGTH: usize = 4097;
const DEFAULT_MAX_TURNS: usize = 10;
const DEFAULT_CHANNEL: &str = "default";

/// Wraps a [`CompletionProvider`] with per-user conversation memory.
pub struct ConversationClient {
    provider: Arc<dyn CompletionProvider>,
    store: Arc<dyn ConversationStore>,
    max_context_length: usize,
    max_turns: usize,
    default_channel: String,
    dispatch: Option<Dispatch>,
}

impl ConversationClient {
    /// Create a client with default limits (4097 code points, 10 turns).
    pub fn new(provider: Arc<dyn CompletionProvider>, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            provider,
            store,
            max_context_length: DEFAULT_MAX_CONTEXT_LENGTH,
            max_turns: DEFAULT_MAX_TURNS,
            default_channel: DEFAULT_CHANNEL.to_string(),
            dispatch: None,
        }
    }

    /// Create a client from the `[conversation]` config section.
    pub fn from_config(
        config: &ConversationConfig,
        provider: Arc<dyn CompletionProvider>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self::new(provider, store)
            .with_max_context_length(config.max_context_length)
            .with_max_turns(config.max_turns)
            .with_default_channel(&config.default_channel)
    }

    pub fn with_max_context_length(mut self, n: usize) -> Self {
        self.max_context_length = n;
        self
    }

    pub fn with_max_turns(mut self, n: usize) -> Self {
        self.max_turns = n;
        self
    }

    pub fn with_default_channel(mut self, channel: impl Into<String>) -> Self {
        self.default_channel = channel.into();
        self
    }

    /// Route this client's diagnostics to `dispatch` instead of the ambient
    /// subscriber.
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn max_context_length(&self) -> usize {
        self.max_context_length
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn default_channel(&self) -> &str {
        &self.default_channel
    }

    /// Single-prompt completion on the default channel.
    pub async fn complete_with_context(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ConversationError> {
        self.complete_with_channel(request, &self.default_channel)
            .await
    }

    /// Single-prompt completion with history from `request.user`'s session.
    pub async fn complete_with_channel(
        &self,
        request: CompletionRequest,
        channel: &str,
    ) -> Result<CompletionResponse, ConversationError> {
        let span = self.span(|| info_span!("complete", user = %request.user, channel = %channel));
        self.traced(span, self.run_completion(request, channel))
            .await
    }

    /// Chat completion on the default channel.
    pub async fn chat_complete_with_context(
        &self,
        request: ChatRequest,
    ) -> Result<ChatResponse, ConversationError> {
        self.chat_complete_with_channel(request, &self.default_channel)
            .await
    }

    /// Chat completion with history from `request.user`'s session.
    pub async fn chat_complete_with_channel(
        &self,
        request: ChatRequest,
        channel: &str,
    ) -> Result<ChatResponse, ConversationError> {
        let span = self.span(|| info_span!("chat", user = %request.user, channel = %channel));
        self.traced(span, self.run_chat(request, channel)).await
    }

    /// Close the user's conversation. Succeeds when none is open.
    pub async fn close_conversation(&self, user_id: &str) -> Result<(), ConversationError> {
        let span = self.span(|| info_span!("close", user = %user_id));
        self.traced(span, async {
            SessionLifecycle::new(self.store.as_ref())
                .close(user_id)
                .await
                .map_err(ConversationError::Close)
        })
        .await
    }

    /// Paired history of the user's active session, oldest first. Empty when
    /// the user has no open session.
    pub async fn history(&self, user_id: &str) -> Result<Vec<Message>, StoreError> {
        SessionLifecycle::new(self.store.as_ref())
            .history(user_id, self.max_turns)
            .await
    }

    // ── Single-prompt flow ──────────────────────────────────────────────

    async fn run_completion(
        &self,
        mut request: CompletionRequest,
        channel: &str,
    ) -> Result<CompletionResponse, ConversationError> {
        debug!(prompt = %request.prompt, "Origin prompt");
        let (session, question) = self
            .pre_completion(&mut request, channel)
            .await
            .map_err(ConversationError::Preprocess)?;
        debug!(prompt = %request.prompt, "Prompt with conversation");

        let response = self.provider.complete(&request).await?;

        let reply = response
            .choices
            .first()
            .map(|c| c.text.as_str())
            .ok_or(ConversationError::Postprocess(PipelineError::EmptyChoices))?;
        self.persist_reply(&session, &question, channel, &request.user, reply)
            .await
            .map_err(ConversationError::Postprocess)?;
        Ok(response)
    }

    async fn pre_completion(
        &self,
        request: &mut CompletionRequest,
        channel: &str,
    ) -> Result<(Session, Message), PipelineError> {
        let budget = self.budget(request.max_tokens)?;
        let session = self.resolve_session(&request.user).await?;

        let prompt = WindowBuilder::new(self.store.as_ref(), budget, self.max_turns)
            .prompt(&session, &request.user, &request.prompt)
            .await;

        // The raw input is stored, not the windowed prompt.
        let question = self
            .store
            .create_message(&session, &request.user, channel, &request.prompt)
            .await
            .map_err(PipelineError::MessagePersist)?;

        request.prompt = prompt;
        let prompt_len = char_len(&request.prompt);
        debug!(
            requested = prompt_len + budget.reserved(),
            prompt = prompt_len,
            completion = budget.reserved(),
            "Requested size"
        );
        Ok((session, question))
    }

    // ── Chat flow ───────────────────────────────────────────────────────

    async fn run_chat(
        &self,
        mut request: ChatRequest,
        channel: &str,
    ) -> Result<ChatResponse, ConversationError> {
        debug!(messages = ?request.messages, "Origin messages");
        let (session, question) = self
            .pre_chat(&mut request, channel)
            .await
            .map_err(ConversationError::Preprocess)?;
        debug!(messages = ?request.messages, "Messages with conversation");

        let response = self.provider.chat(&request).await?;

        let reply = response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or(ConversationError::Postprocess(PipelineError::EmptyChoices))?;
        self.persist_reply(&session, &question, channel, &request.user, reply)
            .await
            .map_err(ConversationError::Postprocess)?;
        Ok(response)
    }

    async fn pre_chat(
        &self,
        request: &mut ChatRequest,
        channel: &str,
    ) -> Result<(Session, Message), PipelineError> {
        let budget = self.budget(request.max_tokens)?;

        // Only the latest user turn of the request is stored.
        let content = last_user_content(&request.messages).ok_or(PipelineError::NoUserMessage)?;

        let session = self.resolve_session(&request.user).await?;
        let question = self
            .store
            .create_message(&session, &request.user, channel, content)
            .await
            .map_err(PipelineError::MessagePersist)?;

        request.messages = WindowBuilder::new(self.store.as_ref(), budget, self.max_turns)
            .messages(&session, &request.user, &request.messages)
            .await;

        let total: usize = request.messages.iter().map(|m| char_len(&m.content)).sum();
        debug!(
            requested = total + budget.reserved(),
            messages = total,
            completion = budget.reserved(),
            "Requested size"
        );
        Ok((session, question))
    }

    // ── Shared steps ────────────────────────────────────────────────────

    fn budget(&self, max_tokens: u32) -> Result<WindowBudget, PipelineError> {
        let reserved = max_tokens as usize;
        WindowBudget::new(self.max_context_length, reserved).ok_or(PipelineError::BudgetConfig {
            reserved,
            limit: self.max_context_length,
        })
    }

    async fn resolve_session(&self, user_id: &str) -> Result<Session, PipelineError> {
        SessionLifecycle::new(self.store.as_ref())
            .resolve_or_create(user_id)
            .await
            .map_err(PipelineError::Session)
    }

    /// Store the model's reply, paired with the user's turn. The channel
    /// acts as the model's principal.
    async fn persist_reply(
        &self,
        session: &Session,
        question: &Message,
        channel: &str,
        user_id: &str,
        reply: &str,
    ) -> Result<Message, PipelineError> {
        let answer = self
            .store
            .create_spouse_message(session, channel, user_id, reply, question)
            .await
            .map_err(PipelineError::MessagePersist)?;
        debug!(question = %question.id, answer = %answer.id, "Persisted reply");
        Ok(answer)
    }

    fn span(&self, make: impl FnOnce() -> Span) -> Span {
        match &self.dispatch {
            Some(dispatch) => tracing::dispatcher::with_default(dispatch, make),
            None => make(),
        }
    }

    async fn traced<F: Future>(&self, span: Span, fut: F) -> F::Output {
        let fut = fut.instrument(span);
        match &self.dispatch {
            Some(dispatch) => fut.with_subscriber(dispatch.clone()).await,
            None => fut.await,
        }
    }
}

fn last_user_content(messages: &[ChatMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
}
