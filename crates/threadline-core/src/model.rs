//! Persisted conversation entities: sessions and the messages inside them.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Closed,
}

/// A bounded conversation thread for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// The user owning this session.
    pub user_id: String,
    pub state: SessionState,
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
    /// Soft-delete marker. The core never sets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<SystemTime>,
}

impl Session {
    /// A fresh session in the `Open` state.
    pub fn open(id: SessionId, user_id: impl Into<String>, now: SystemTime) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            state: SessionState::Open,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Whether this session can still receive turns.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open && self.deleted_at.is_none()
    }

    /// Transition `Open → Closed`.
    ///
    /// Returns `false` when the session was already closed; there is no
    /// transition back to `Open`.
    pub fn close(&mut self, now: SystemTime) -> bool {
        match self.state {
            SessionState::Open => {
                self.state = SessionState::Closed;
                self.updated_at = now;
                true
            }
            SessionState::Closed => false,
        }
    }
}

/// One turn in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    /// Sender: the requesting user, or the channel acting as the model principal.
    pub from_user_id: String,
    /// Recipient.
    pub to_user_id: String,
    pub content: String,
    /// The paired reply (on a question) or question (on a reply).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spouse_id: Option<MessageId>,
    pub created_at: SystemTime,
}

impl Message {
    /// Whether this message has been answered (or answers another).
    pub fn has_spouse(&self) -> bool {
        self.spouse_id.is_some()
    }

    /// Whether `user_id` authored this message.
    pub fn is_from(&self, user_id: &str) -> bool {
        self.from_user_id == user_id
    }
}
