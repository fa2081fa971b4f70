//! Session lifecycle — `Open → Closed`, keyed by user id.
//!
//! A user has at most one session the core treats as active: the newest open
//! one. [`SessionLifecycle::resolve_or_create`] is the only transition that
//! creates state; [`SessionLifecycle::close`] is the only one that ends it. A
//! closed session is never reopened, the next request simply starts a new one.

use tracing::{debug, info, warn};

use crate::model::{Message, Session};
use crate::store::{ConversationStore, StoreError};

/// Open/close semantics over a [`ConversationStore`].
#[derive(Clone, Copy)]
pub struct SessionLifecycle<'a> {
    store: &'a dyn ConversationStore,
}

impl<'a> SessionLifecycle<'a> {
    pub fn new(store: &'a dyn ConversationStore) -> Self {
        Self { store }
    }

    /// The user's active session, or a freshly created one.
    ///
    /// Any lookup failure falls through to creation; only a failed creation is
    /// an error.
    pub async fn resolve_or_create(&self, user_id: &str) -> Result<Session, StoreError> {
        match self.store.latest_active_session(user_id).await {
            Ok(session) => {
                debug!(user = %user_id, session = %session.id, "Resolved active session");
                return Ok(session);
            }
            Err(StoreError::NotFound) => {}
            Err(e) => {
                warn!(user = %user_id, error = %e, "Active session lookup failed, creating a new session");
            }
        }

        let session = self.store.create_session(user_id).await?;
        info!(user = %user_id, session = %session.id, "Created session");
        Ok(session)
    }

    /// Close the user's active session(s). A no-op when none is open.
    pub async fn close(&self, user_id: &str) -> Result<(), StoreError> {
        self.store.close_session(user_id).await?;
        info!(user = %user_id, "Closed conversation");
        Ok(())
    }

    /// Up to `max_turns` answered turns of the active session, oldest first.
    /// Empty when the user has no open session.
    pub async fn history(&self, user_id: &str, max_turns: usize) -> Result<Vec<Message>, StoreError> {
        let session = match self.store.latest_active_session(user_id).await {
            Ok(session) => session,
            Err(StoreError::NotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut messages = self
            .store
            .list_latest_paired_messages(&session, user_id, max_turns)
            .await?;
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }
}
