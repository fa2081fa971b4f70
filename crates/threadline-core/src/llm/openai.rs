//! OpenAI-compatible API provider.
//!
//! Implements [`CompletionProvider`] against the `/completions` and
//! `/chat/completions` endpoints. Any server that follows the OpenAI API format
//! (vLLM, Ollama, LocalAI, ...) works with a custom base URL.

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::BoxFuture;

use super::provider::{CompletionProvider, LlmError};
use super::types::*;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// OpenAI-compatible provider.
pub struct OpenAiProvider {
    client: Client,
    api_key: Zeroizing<String>,
    base_url: String,
    chat_model: String,
    completion_model: String,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("chat_model", &self.chat_model)
            .field("completion_model", &self.completion_model)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OpenAiProvider {
    /// Create a new OpenAI provider with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: Zeroizing::new(api_key.into()),
            base_url: OPENAI_API_BASE.to_string(),
            chat_model: "gpt-3.5-turbo".to_string(),
            completion_model: "gpt-3.5-turbo-instruct".to_string(),
            timeout: None,
        }
    }

    /// Default model for chat requests that leave `model` empty.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    /// Default model for completion requests that leave `model` empty.
    pub fn with_completion_model(mut self, model: impl Into<String>) -> Self {
        self.completion_model = model.into();
        self
    }

    /// Set a custom API root (for OpenAI-compatible providers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    fn build_completion_body(&self, request: &CompletionRequest) -> OpenAiCompletionRequest {
        OpenAiCompletionRequest {
            model: pick_model(&request.model, &self.completion_model),
            prompt: request.prompt.clone(),
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
            top_p: Some(request.top_p),
            presence_penalty: Some(request.presence_penalty),
            user: non_empty(&request.user),
        }
    }

    fn build_chat_body(&self, request: &ChatRequest) -> OpenAiChatRequest {
        OpenAiChatRequest {
            model: pick_model(&request.model, &self.chat_model),
            messages: request.messages.clone(),
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
            top_p: Some(request.top_p),
            presence_penalty: Some(request.presence_penalty),
            user: non_empty(&request.user),
        }
    }

    /// POST `body` to `path` and decode the JSON reply, mapping HTTP failures
    /// onto [`LlmError`].
    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, LlmError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut builder = self
            .client
            .post(self.endpoint(path))
            .header("authorization", format!("Bearer {}", self.api_key.as_str()))
            .header("content-type", "application/json")
            .json(body);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Network(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        if status == 401 {
            return Err(LlmError::Auth("invalid API key".to_string()));
        }
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let error_body = resp.text().await.unwrap_or_default();
            if status == 400 && error_body.contains("context_length_exceeded") {
                return Err(LlmError::ContextLength(error_body));
            }
            return Err(LlmError::ProviderError {
                status,
                message: error_body,
            });
        }

        resp.json().await.map_err(|e| LlmError::Parse(e.to_string()))
    }
}

impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "OpenAI"
    }

    fn complete<'a>(
        &'a self,
        request: &'a CompletionRequest,
    ) -> BoxFuture<'a, Result<CompletionResponse, LlmError>> {
        let body = self.build_completion_body(request);
        Box::pin(async move {
            debug!(model = %body.model, "OpenAI completion request");
            let resp: OpenAiCompletionResponse = self.post("completions", &body).await?;
            Ok(resp.into())
        })
    }

    fn chat<'a>(&'a self, request: &'a ChatRequest) -> BoxFuture<'a, Result<ChatResponse, LlmError>> {
        let body = self.build_chat_body(request);
        Box::pin(async move {
            debug!(model = %body.model, messages = body.messages.len(), "OpenAI chat request");
            let resp: OpenAiChatResponse = self.post("chat/completions", &body).await?;
            Ok(resp.into())
        })
    }
}

fn pick_model(requested: &str, fallback: &str) -> String {
    if requested.is_empty() {
        fallback.to_string()
    } else {
        requested.to_string()
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

// ── OpenAI API types (private) ──────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OpenAiCompletionRequest {
    model: String,
    prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiCompletionResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    usage: Option<TokenUsage>,
}

impl From<OpenAiCompletionResponse> for CompletionResponse {
    fn from(resp: OpenAiCompletionResponse) -> Self {
        Self {
            id: resp.id,
            model: resp.model,
            choices: resp.choices,
            usage: resp.usage.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
}

impl From<OpenAiChatResponse> for ChatResponse {
    fn from(resp: OpenAiChatResponse) -> Self {
        Self {
            id: resp.id,
            model: resp.model,
            choices: resp.choices,
            usage: resp.usage.unwrap_or_default(),
        }
    }
}
