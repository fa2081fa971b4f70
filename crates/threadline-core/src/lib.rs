#![deny(unsafe_code)]

//! Threadline core — conversational memory for a stateless completion API.
//!
//! Wraps a completion provider so that each request carries the user's recent
//! history, packed into a fixed context budget, and each exchange is written
//! back to a pluggable conversation store as a question/answer pair.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future — the return type for async trait
/// methods that need dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits is not object-safe. Traits consumed via
/// `Arc<dyn Trait>` or `&dyn Trait` return a concrete `Pin<Box<dyn Future>>`
/// instead; this alias keeps those signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request orchestration: session resolution, windowing, persistence.
pub mod client;
/// Budget-bounded context window assembly.
pub mod context;
/// Orchestrator error taxonomy.
pub mod error;
/// Completion provider trait, wire types, and the OpenAI adapter.
pub mod llm;
/// In-memory `tracing` capture for diagnostics and tests.
pub mod logging;
/// Session and message entities.
pub mod model;
/// Session lifecycle over a store.
pub mod session;
/// Conversation store trait and adapters.
pub mod store;

pub use client::ConversationClient;
pub use error::{ConversationError, PipelineError};
pub use llm::{CompletionProvider, LlmError};
pub use logging::{LogCollector, LogEntry, LogReader};
pub use model::{Message, MessageId, Session, SessionId, SessionState};
pub use store::{ConversationStore, JsonFileStore, MemoryStore, SqliteStore, StoreError};
