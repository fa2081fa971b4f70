//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use threadline_config::AppConfig;

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .max_context_length(64)
///     .max_tokens(8)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    pub fn max_context_length(mut self, n: usize) -> Self {
        self.config.conversation.max_context_length = n;
        self
    }

    pub fn max_turns(mut self, n: usize) -> Self {
        self.config.conversation.max_turns = n;
        self
    }

    pub fn default_channel(mut self, channel: &str) -> Self {
        self.config.conversation.default_channel = channel.to_string();
        self
    }

    pub fn api_key(mut self, key: &str) -> Self {
        self.config.llm.api_key = key.to_string();
        self
    }

    pub fn base_url(mut self, url: &str) -> Self {
        self.config.llm.base_url = Some(url.to_string());
        self
    }

    pub fn max_tokens(mut self, n: u32) -> Self {
        self.config.llm.max_tokens = n;
        self
    }

    pub fn store_backend(mut self, backend: &str) -> Self {
        self.config.store.backend = backend.to_string();
        self
    }

    pub fn store_path(mut self, path: &str) -> Self {
        self.config.store.path = path.to_string();
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
