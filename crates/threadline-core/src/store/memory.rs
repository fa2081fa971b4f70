//! In-process conversation store.
//!
//! [`Ledger`] holds the entity tables and enforces the message invariants; it
//! is shared with [`JsonFileStore`](super::JsonFileStore), which snapshots it to
//! disk after every write.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::BoxFuture;
use crate::model::{Message, MessageId, Session, SessionId};

use super::{ConversationStore, StoreError};

/// Entity tables plus id/clock counters.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Ledger {
    sessions: Vec<Session>,
    messages: Vec<Message>,
    next_session_id: u64,
    next_message_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_timestamp: Option<SystemTime>,
}

impl Ledger {
    /// Wall-clock time, nudged forward so no two writes share a timestamp.
    fn tick(&mut self) -> SystemTime {
        let mut now = SystemTime::now();
        if let Some(last) = self.last_timestamp {
            if now <= last {
                now = last + Duration::from_micros(1);
            }
        }
        self.last_timestamp = Some(now);
        now
    }

    pub(crate) fn create_session(&mut self, user_id: &str) -> Session {
        self.next_session_id += 1;
        let now = self.tick();
        let session = Session::open(SessionId(self.next_session_id), user_id, now);
        self.sessions.push(session.clone());
        session
    }

    /// Returns how many sessions were closed.
    pub(crate) fn close_sessions(&mut self, user_id: &str) -> usize {
        let now = self.tick();
        let mut closed = 0;
        for session in self.sessions.iter_mut().filter(|s| s.user_id == user_id) {
            if session.close(now) {
                closed += 1;
            }
        }
        closed
    }

    pub(crate) fn latest_active_session(&self, user_id: &str) -> Option<Session> {
        self.sessions
            .iter()
            .filter(|s| s.user_id == user_id && s.is_open())
            .max_by_key(|s| (s.created_at, s.id))
            .cloned()
    }

    pub(crate) fn create_message(
        &mut self,
        session: &Session,
        from_user_id: &str,
        to_user_id: &str,
        content: &str,
        spouse: Option<&Message>,
    ) -> Result<Message, StoreError> {
        if !self.sessions.iter().any(|s| s.id == session.id) {
            return Err(StoreError::Invalid(format!(
                "session {} does not exist",
                session.id
            )));
        }

        let spouse_index = match spouse {
            Some(spouse) => {
                if spouse.session_id != session.id {
                    return Err(StoreError::Invalid(format!(
                        "spouse message {} belongs to session {}, not {}",
                        spouse.id, spouse.session_id, session.id
                    )));
                }
                let index = self
                    .messages
                    .iter()
                    .position(|m| m.id == spouse.id)
                    .ok_or_else(|| {
                        StoreError::Invalid(format!("spouse message {} does not exist", spouse.id))
                    })?;
                if let Some(existing) = self.messages[index].spouse_id {
                    return Err(StoreError::Invalid(format!(
                        "message {} is already paired with {existing}",
                        spouse.id
                    )));
                }
                Some(index)
            }
            None => None,
        };

        self.next_message_id += 1;
        let id = MessageId(self.next_message_id);
        let now = self.tick();
        let message = Message {
            id,
            session_id: session.id,
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            content: content.to_string(),
            spouse_id: spouse.map(|s| s.id),
            created_at: now,
        };

        if let Some(index) = spouse_index {
            self.messages[index].spouse_id = Some(id);
        }
        self.messages.push(message.clone());
        Ok(message)
    }

    pub(crate) fn list_latest_paired_messages(
        &self,
        session: &Session,
        user_id: &str,
        max_turns: usize,
    ) -> Vec<Message> {
        let mut questions: Vec<&Message> = self
            .messages
            .iter()
            .filter(|m| m.session_id == session.id && m.is_from(user_id) && m.has_spouse())
            .collect();
        questions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        questions.truncate(max_turns);
        questions.reverse();

        let mut pairs = Vec::with_capacity(questions.len() * 2);
        for question in questions {
            let answer = self.messages.iter().find(|m| {
                Some(m.id) == question.spouse_id
                    && m.spouse_id == Some(question.id)
                    && m.to_user_id == user_id
            });
            if let Some(answer) = answer {
                pairs.push(question.clone());
                pairs.push(answer.clone());
            }
        }
        pairs
    }

    pub(crate) fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub(crate) fn messages(&self) -> &[Message] {
        &self.messages
    }
}

/// Conversation store kept entirely in memory. Contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    ledger: Mutex<Ledger>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every session, in creation order.
    pub fn sessions(&self) -> Vec<Session> {
        self.ledger
            .lock()
            .map(|l| l.sessions().to_vec())
            .unwrap_or_default()
    }

    /// Snapshot of every message, in creation order.
    pub fn messages(&self) -> Vec<Message> {
        self.ledger
            .lock()
            .map(|l| l.messages().to_vec())
            .unwrap_or_default()
    }

    fn with_ledger<T>(
        &self,
        f: impl FnOnce(&mut Ledger) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut ledger = self
            .ledger
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        f(&mut ledger)
    }
}

impl ConversationStore for MemoryStore {
    fn create_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Session, StoreError>> {
        Box::pin(async move { self.with_ledger(|l| Ok(l.create_session(user_id))) })
    }

    fn close_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.with_ledger(|l| {
                l.close_sessions(user_id);
                Ok(())
            })
        })
    }

    fn latest_active_session<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Session, StoreError>> {
        Box::pin(async move {
            self.with_ledger(|l| l.latest_active_session(user_id).ok_or(StoreError::NotFound))
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
            self.with_ledger(|l| l.create_message(session, from_user_id, to_user_id, content, None))
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
            self.with_ledger(|l| {
                l.create_message(session, from_user_id, to_user_id, content, Some(spouse))
            })
        })
    }

    fn list_latest_paired_messages<'a>(
        &'a self,
        session: &'a Session,
        user_id: &'a str,
        max_turns: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        Box::pin(async move {
            self.with_ledger(|l| Ok(l.list_latest_paired_messages(session, user_id, max_turns)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_latest_active_session_not_found() {
        let store = MemoryStore::new();
        let err = store.latest_active_session("alice").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_and_resolve_session() {
        let store = MemoryStore::new();
        let created = store.create_session("alice").await.unwrap();
        let active = store.latest_active_session("alice").await.unwrap();
        assert_eq!(created, active);
        assert!(store.latest_active_session("bob").await.is_err());
    }

    #[tokio::test]
    async fn test_latest_active_prefers_newest() {
        let store = MemoryStore::new();
        let _old = store.create_session("alice").await.unwrap();
        let new = store.create_session("alice").await.unwrap();
        let active = store.latest_active_session("alice").await.unwrap();
        assert_eq!(active.id, new.id);
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent() {
        let store = MemoryStore::new();
        store.close_session("nobody").await.unwrap();

        store.create_session("alice").await.unwrap();
        store.close_session("alice").await.unwrap();
        store.close_session("alice").await.unwrap();
        assert!(store.latest_active_session("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_spouse_links_both_directions() {
        let store = MemoryStore::new();
        let session = store.create_session("alice").await.unwrap();
        let question = store
            .create_message(&session, "alice", "default", "hi")
            .await
            .unwrap();
        let answer = store
            .create_spouse_message(&session, "default", "alice", "hello", &question)
            .await
            .unwrap();

        assert_eq!(answer.spouse_id, Some(question.id));
        let stored = store.messages();
        assert_eq!(stored[0].spouse_id, Some(answer.id));
        assert!(answer.created_at > question.created_at);
    }

    #[tokio::test]
    async fn test_spouse_from_other_session_rejected() {
        let store = MemoryStore::new();
        let first = store.create_session("alice").await.unwrap();
        let question = store
            .create_message(&first, "alice", "default", "hi")
            .await
            .unwrap();
        let second = store.create_session("alice").await.unwrap();

        let err = store
            .create_spouse_message(&second, "default", "alice", "hello", &question)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_spouse_cannot_be_paired_twice() {
        let store = MemoryStore::new();
        let session = store.create_session("alice").await.unwrap();
        let question = store
            .create_message(&session, "alice", "default", "hi")
            .await
            .unwrap();
        store
            .create_spouse_message(&session, "default", "alice", "one", &question)
            .await
            .unwrap();
        let err = store
            .create_spouse_message(&session, "default", "alice", "two", &question)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_list_paired_skips_unanswered_and_limits_turns() {
        let store = MemoryStore::new();
        let session = store.create_session("alice").await.unwrap();
        for i in 0..3 {
            let q = store
                .create_message(&session, "alice", "default", &format!("q{i}"))
                .await
                .unwrap();
            store
                .create_spouse_message(&session, "default", "alice", &format!("a{i}"), &q)
                .await
                .unwrap();
        }
        store
            .create_message(&session, "alice", "default", "unanswered")
            .await
            .unwrap();

        let pairs = store
            .list_latest_paired_messages(&session, "alice", 2)
            .await
            .unwrap();
        let contents: Vec<&str> = pairs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
    }
}
