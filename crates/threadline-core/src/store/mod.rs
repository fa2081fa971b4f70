//! Conversation persistence — the narrow contract the core reads and writes
//! history through, plus the adapters shipped with Threadline.
//!
//! ```text
//! ┌────────────────────┐     ┌───────────────────┐
//! │ ConversationClient │────▶│ ConversationStore │  (trait)
//! └────────────────────┘     └─────────┬─────────┘
//!                                      │
//!                 ┌────────────────────┼────────────────────┐
//!                 ▼                    ▼                    ▼
//!         ┌──────────────┐    ┌───────────────┐    ┌──────────────┐
//!         │ MemoryStore  │    │ JsonFileStore │    │ SqliteStore  │
//!         └──────────────┘    └───────────────┘    └──────────────┘
//! ```
//!
//! Nothing backend-specific crosses this boundary: the window builder and the
//! orchestrator only ever see [`Session`] and [`Message`] values.

pub mod json;
pub mod memory;
pub mod sqlite;

pub use json::JsonFileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use threadline_config::StoreConfig;

use crate::BoxFuture;
use crate::model::{Message, Session};

/// Errors from a conversation store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested entity does not exist (e.g. no active session).
    #[error("not found")]
    NotFound,

    /// The write would break an entity invariant.
    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Any other backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Storage contract for sessions and messages.
///
/// Implementations must be `Send + Sync`; every method returns a
/// [`BoxFuture`] so that the trait stays object-safe (`Arc<dyn ConversationStore>`).
pub trait ConversationStore: Send + Sync {
    /// Create a new `Open` session for `user_id`.
    fn create_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Session, StoreError>>;

    /// Close every open session of `user_id`. Succeeds when none is open.
    fn close_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// The most recently created open session of `user_id`, or
    /// [`StoreError::NotFound`].
    fn latest_active_session<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Session, StoreError>>;

    /// Persist an unpaired message.
    fn create_message<'a>(
        &'a self,
        session: &'a Session,
        from_user_id: &'a str,
        to_user_id: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, Result<Message, StoreError>>;

    /// Persist a message paired with `spouse`, linking both directions.
    ///
    /// The spouse must belong to `session`.
    fn create_spouse_message<'a>(
        &'a self,
        session: &'a Session,
        from_user_id: &'a str,
        to_user_id: &'a str,
        content: &'a str,
        spouse: &'a Message,
    ) -> BoxFuture<'a, Result<Message, StoreError>>;

    /// Up to `max_turns` answered messages from `user_id` in `session`, each
    /// followed by its reply. Ordering is not part of the contract.
    fn list_latest_paired_messages<'a>(
        &'a self,
        session: &'a Session,
        user_id: &'a str,
        max_turns: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>>;
}

/// Open the backend named by `config.backend`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, StoreError> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "json" => Ok(Arc::new(JsonFileStore::open(&config.path).await?)),
        "sqlite" => Ok(Arc::new(SqliteStore::open(&config.path).await?)),
        other => Err(StoreError::Backend(format!("unknown store backend '{other}'"))),
    }
}
