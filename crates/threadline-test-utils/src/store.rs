//! A [`ConversationStore`] with switchable failures.
//!
//! [`FaultyStore`] delegates to a [`MemoryStore`] and counts every call. Any
//! operation can be made to fail with [`StoreError::Backend`] until healed.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use threadline_core::BoxFuture;
use threadline_core::model::{Message, Session};
use threadline_core::store::{ConversationStore, MemoryStore, StoreError};

/// Store operations, for failure switches and call counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CreateSession,
    CloseSession,
    LatestActiveSession,
    CreateMessage,
    CreateSpouseMessage,
    ListLatestPairedMessages,
}

#[derive(Default)]
pub struct FaultyStore {
    inner: MemoryStore,
    failing: Mutex<HashSet<StoreOp>>,
    calls: Mutex<HashMap<StoreOp, usize>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` fail until [`heal`](Self::heal) is called.
    pub fn fail(&self, op: StoreOp) -> &Self {
        lock(&self.failing).insert(op);
        self
    }

    pub fn heal(&self, op: StoreOp) -> &Self {
        lock(&self.failing).remove(&op);
        self
    }

    /// Number of times `op` was invoked, failed or not.
    pub fn calls(&self, op: StoreOp) -> usize {
        lock(&self.calls).get(&op).copied().unwrap_or(0)
    }

    /// Total number of store calls.
    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    /// The backing store, for inspecting persisted state.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    fn enter(&self, op: StoreOp) -> Result<(), StoreError> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;
        if lock(&self.failing).contains(&op) {
            return Err(StoreError::Backend(format!("injected failure: {op:?}")));
        }
        Ok(())
    }
}

impl ConversationStore for FaultyStore {
    fn create_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Session, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::CreateSession)?;
            self.inner.create_session(user_id).await
        })
    }

    fn close_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::CloseSession)?;
            self.inner.close_session(user_id).await
        })
    }

    fn latest_active_session<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Session, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::LatestActiveSession)?;
            self.inner.latest_active_session(user_id).await
        })
    }

    fn create_message<'a>(
        &'a self,
        session: &'a Session,
        from_user_id: &'a str,
        to_user_id: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, Result<Message, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::CreateMessage)?;
            self.inner
                .create_message(session, from_user_id, to_user_id, content)
                .await
        })
    }

    fn create_spouse_message<'a>(
        &'a self,
        session: &'a Session,
        from_user_id: &'a str,
        to_user_id: &'a str,
        content: &'a str,
        spouse: &'a Message,
    ) -> BoxFuture<'a, Result<Message, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::CreateSpouseMessage)?;
            self.inner
                .create_spouse_message(session, from_user_id, to_user_id, content, spouse)
                .await
        })
    }

    fn list_latest_paired_messages<'a>(
        &'a self,
        session: &'a Session,
        user_id: &'a str,
        max_turns: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        Box::pin(async move {
            self.enter(StoreOp::ListLatestPairedMessages)?;
            self.inner
                .list_latest_paired_messages(session, user_id, max_turns)
                .await
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
