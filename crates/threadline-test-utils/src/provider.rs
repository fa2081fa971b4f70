//! A [`CompletionProvider`] that replays queued responses.
//!
//! Every request is recorded before its scripted outcome is popped, so tests
//! can assert on the exact prompt or message list the orchestrator sent. An
//! exhausted script answers with [`LlmError::Request`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use threadline_core::BoxFuture;
use threadline_core::llm::{
    ChatChoice, ChatMessage, ChatRequest, ChatResponse, CompletionChoice, CompletionProvider,
    CompletionRequest, CompletionResponse, LlmError,
};

#[derive(Default)]
pub struct ScriptedProvider {
    completions: Mutex<VecDeque<Result<CompletionResponse, LlmError>>>,
    chats: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    completion_requests: Mutex<Vec<CompletionRequest>>,
    chat_requests: Mutex<Vec<ChatRequest>>,
    delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue a single-choice completion answering `text`.
    pub fn push_completion(&self, text: &str) -> &Self {
        self.push_completion_result(Ok(completion_response(&[text])))
    }

    pub fn push_completion_result(&self, result: Result<CompletionResponse, LlmError>) -> &Self {
        lock(&self.completions).push_back(result);
        self
    }

    /// Queue a single-choice chat response answering `text`.
    pub fn push_chat(&self, text: &str) -> &Self {
        self.push_chat_result(Ok(chat_response(&[text])))
    }

    pub fn push_chat_result(&self, result: Result<ChatResponse, LlmError>) -> &Self {
        lock(&self.chats).push_back(result);
        self
    }

    /// Requests received by `complete`, in arrival order.
    pub fn completion_requests(&self) -> Vec<CompletionRequest> {
        lock(&self.completion_requests).clone()
    }

    /// Requests received by `chat`, in arrival order.
    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        lock(&self.chat_requests).clone()
    }

    /// Total number of provider calls.
    pub fn calls(&self) -> usize {
        lock(&self.completion_requests).len() + lock(&self.chat_requests).len()
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<CompletionResponse, LlmError>> {
        Box::pin(async move {
            lock(&self.completion_requests).push(request.clone());
            self.pause().await;
            lock(&self.completions)
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Request("completion script exhausted".into())))
        })
    }

    fn chat<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ChatResponse, LlmError>> {
        Box::pin(async move {
            lock(&self.chat_requests).push(request.clone());
            self.pause().await;
            lock(&self.chats)
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::Request("chat script exhausted".into())))
        })
    }
}

/// A completion response with one choice per entry of `texts`.
pub fn completion_response(texts: &[&str]) -> CompletionResponse {
    CompletionResponse {
        id: "cmpl-scripted".to_string(),
        model: "scripted".to_string(),
        choices: texts
            .iter()
            .enumerate()
            .map(|(i, text)| CompletionChoice {
                index: i as u32,
                text: text.to_string(),
                finish_reason: Some("stop".to_string()),
            })
            .collect(),
        ..CompletionResponse::default()
    }
}

/// A chat response with one assistant choice per entry of `texts`.
pub fn chat_response(texts: &[&str]) -> ChatResponse {
    ChatResponse {
        id: "chatcmpl-scripted".to_string(),
        model: "scripted".to_string(),
        choices: texts
            .iter()
            .enumerate()
            .map(|(i, text)| ChatChoice {
                index: i as u32,
                message: ChatMessage::assistant(*text),
                finish_reason: Some("stop".to_string()),
            })
            .collect(),
        ..ChatResponse::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
