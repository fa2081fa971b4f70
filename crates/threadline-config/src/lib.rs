#![deny(unsafe_code)]

//! Configuration loading and validation for Threadline.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure.
//!
//! ## TOML Example
//!
//! ```toml
//! [conversation]
//! max_context_length = 4097
//! max_turns = 10
//! default_channel = "default"
//!
//! [llm]
//! provider = "openai"
//! api_key_env = "OPENAI_API_KEY"
//! model = "gpt-3.5-turbo"
//! max_tokens = 256
//!
//! [store]
//! backend = "sqlite"
//! path = "/var/lib/threadline/conversations.db"
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Context window and session settings.
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Completion provider settings.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Conversation store backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Context window and session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Hard upper bound on prompt + completion size, in code points.
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    /// Maximum number of question/answer pairs pulled from history.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Channel tag used when the caller does not name one.
    #[serde(default = "default_channel")]
    pub default_channel: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_context_length: default_max_context_length(),
            max_turns: default_max_turns(),
            default_channel: default_channel(),
        }
    }
}

fn default_max_context_length() -> usize {
    4097
}

fn default_max_turns() -> usize {
    10
}

fn default_channel() -> String {
    "default".to_string()
}

/// Which completion API dialect to speak.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LlmProviderKind {
    /// OpenAI and OpenAI-compatible endpoints (vLLM, Ollama, ...).
    #[default]
    #[serde(rename = "openai")]
    OpenAi,
}

/// Completion provider settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderKind,

    /// Inline API key. Prefer `api_key_env` outside of local testing.
    #[serde(default)]
    pub api_key: String,

    /// Environment variable consulted when `api_key` is empty.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for chat completions.
    #[serde(default = "default_chat_model")]
    pub model: String,

    /// Model used for single-prompt completions.
    #[serde(default = "default_completion_model")]
    pub completion_model: String,

    /// Endpoint root, e.g. `http://localhost:11434/v1`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Tokens reserved for the completion.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Per-request timeout in seconds (0 = no timeout).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderKind::default(),
            api_key: String::new(),
            api_key_env: default_api_key_env(),
            model: default_chat_model(),
            completion_model: default_completion_model(),
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let api_key = if self.api_key.is_empty() {
            ""
        } else {
            "[REDACTED]"
        };
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("api_key", &api_key)
            .field("api_key_env", &self.api_key_env)
            .field("model", &self.model)
            .field("completion_model", &self.completion_model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl LlmConfig {
    /// The API key to use: the inline key, or the value of `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_chat_model() -> String {
    "gpt-3.5-turbo".to_string()
}

fn default_completion_model() -> String {
    "gpt-3.5-turbo-instruct".to_string()
}

fn default_max_tokens() -> u32 {
    256
}

fn default_temperature() -> f32 {
    0.9
}

fn default_timeout_secs() -> u64 {
    60
}

/// Conversation store backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend: "sqlite", "json" or "memory".
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Database file or JSON document, depending on the backend. Unused by
    /// "memory".
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

fn default_store_backend() -> String {
    "sqlite".to_string()
}

fn default_store_path() -> String {
    "threadline.db".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conversation = &self.conversation;
        if conversation.max_context_length == 0 {
            return Err(ConfigError::Validation(
                "conversation.max_context_length must be non-zero".to_string(),
            ));
        }
        if conversation.max_turns == 0 {
            return Err(ConfigError::Validation(
                "conversation.max_turns must be at least 1".to_string(),
            ));
        }
        if conversation.default_channel.is_empty() {
            return Err(ConfigError::Validation(
                "conversation.default_channel must not be empty".to_string(),
            ));
        }

        // The reserved completion size has to leave room for a prompt.
        if self.llm.max_tokens as usize >= conversation.max_context_length {
            return Err(ConfigError::Validation(format!(
                "llm.max_tokens ({}) must be less than conversation.max_context_length ({})",
                self.llm.max_tokens, conversation.max_context_length
            )));
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Validation(format!(
                "llm.temperature must be in [0.0, 2.0], got {}",
                self.llm.temperature
            )));
        }
        if self.llm.model.is_empty() || self.llm.completion_model.is_empty() {
            return Err(ConfigError::Validation(
                "llm.model and llm.completion_model must not be empty".to_string(),
            ));
        }
        if self.llm.api_key.is_empty() && self.llm.api_key_env.is_empty() {
            return Err(ConfigError::Validation(
                "one of llm.api_key or llm.api_key_env must be set".to_string(),
            ));
        }

        let valid_backends = ["sqlite", "json", "memory"];
        if !valid_backends.contains(&self.store.backend.as_str()) {
            return Err(ConfigError::Validation(format!(
                "store.backend must be one of {:?}, got {:?}",
                valid_backends, self.store.backend
            )));
        }
        if self.store.backend != "memory" && self.store.path.is_empty() {
            return Err(ConfigError::Validation(format!(
                "store.path is required when store.backend is {:?}",
                self.store.backend
            )));
        }

        Ok(())
    }
}
