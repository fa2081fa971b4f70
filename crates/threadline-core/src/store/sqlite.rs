//! Conversation store backed by SQLite.
//!
//! - Two tables, `sessions` and `messages`, created on open.
//! - WAL journal; every write is a single statement or transaction.
//! - Statements run on the blocking pool. A dropped caller future does not
//!   abort a statement that already started, and no write is half-applied.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{debug, info};

use crate::BoxFuture;
use crate::model::{Message, MessageId, Session, SessionId, SessionState};

use super::{ConversationStore, StoreError};

/// Sessions: one row per conversation thread.
const SESSIONS: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sessions_user_state ON sessions(user_id, state, created_at);
";

/// Messages: `spouse_id` links a question and its answer in both directions.
const MESSAGES: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id),
    from_user_id TEXT NOT NULL,
    to_user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    spouse_id INTEGER REFERENCES messages(id),
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session_from ON messages(session_id, from_user_id, created_at);
";

const SESSION_COLUMNS: &str = "id, user_id, state, created_at, updated_at, deleted_at";

/// Connection plus the write clock.
struct Db {
    conn: Connection,
    /// Last timestamp handed out, in microseconds since the epoch.
    last_micros: i64,
}

impl Db {
    fn new(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SESSIONS)?;
        conn.execute_batch(MESSAGES)?;
        let last_micros: Option<i64> = conn.query_row(
            "SELECT MAX(ts) FROM (
                SELECT MAX(created_at) AS ts FROM messages
                UNION ALL SELECT MAX(updated_at) FROM sessions
            )",
            [],
            |row| row.get(0),
        )?;
        Ok(Self {
            conn,
            last_micros: last_micros.unwrap_or(0),
        })
    }

    /// Wall-clock time in microseconds, nudged forward so no two writes
    /// share a timestamp.
    fn tick(&mut self) -> i64 {
        let now = to_micros(SystemTime::now()).max(self.last_micros + 1);
        self.last_micros = now;
        now
    }

    fn create_session(&mut self, user_id: &str) -> Result<Session, StoreError> {
        let now = self.tick();
        self.conn.execute(
            "INSERT INTO sessions (user_id, state, created_at, updated_at) VALUES (?1, 'open', ?2, ?2)",
            params![user_id, now],
        )?;
        let id = self.conn.last_insert_rowid();
        Ok(Session::open(SessionId(id as u64), user_id, from_micros(now)))
    }

    fn close_sessions(&mut self, user_id: &str) -> Result<usize, StoreError> {
        let now = self.tick();
        let closed = self.conn.execute(
            "UPDATE sessions SET state = 'closed', updated_at = ?1 WHERE user_id = ?2 AND state = 'open'",
            params![now, user_id],
        )?;
        Ok(closed)
    }

    fn latest_active_session(&self, user_id: &str) -> Result<Option<Session>, StoreError> {
        let session = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE user_id = ?1 AND state = 'open' AND deleted_at IS NULL
                     ORDER BY created_at DESC, id DESC LIMIT 1"
                ),
                [user_id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    fn create_message(
        &mut self,
        session: &Session,
        from_user_id: &str,
        to_user_id: &str,
        content: &str,
        spouse: Option<&Message>,
    ) -> Result<Message, StoreError> {
        let now = self.tick();
        let tx = self.conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                [session.id.0 as i64],
                |_| Ok(()),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::Invalid(format!(
                "session {} does not exist",
                session.id
            )));
        }

        if let Some(spouse) = spouse {
            if spouse.session_id != session.id {
                return Err(StoreError::Invalid(format!(
                    "spouse message {} belongs to session {}, not {}",
                    spouse.id, spouse.session_id, session.id
                )));
            }
            let existing: Option<Option<i64>> = tx
                .query_row(
                    "SELECT spouse_id FROM messages WHERE id = ?1",
                    [spouse.id.0 as i64],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                None => {
                    return Err(StoreError::Invalid(format!(
                        "spouse message {} does not exist",
                        spouse.id
                    )));
                }
                Some(Some(paired)) => {
                    return Err(StoreError::Invalid(format!(
                        "message {} is already paired with {paired}",
                        spouse.id
                    )));
                }
                Some(None) => {}
            }
        }

        tx.execute(
            "INSERT INTO messages (session_id, from_user_id, to_user_id, content, spouse_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session.id.0 as i64,
                from_user_id,
                to_user_id,
                content,
                spouse.map(|s| s.id.0 as i64),
                now
            ],
        )?;
        let id = tx.last_insert_rowid();
        if let Some(spouse) = spouse {
            tx.execute(
                "UPDATE messages SET spouse_id = ?1 WHERE id = ?2",
                params![id, spouse.id.0 as i64],
            )?;
        }
        tx.commit()?;

        Ok(Message {
            id: MessageId(id as u64),
            session_id: session.id,
            from_user_id: from_user_id.to_string(),
            to_user_id: to_user_id.to_string(),
            content: content.to_string(),
            spouse_id: spouse.map(|s| s.id),
            created_at: from_micros(now),
        })
    }

    fn list_latest_paired_messages(
        &self,
        session: &Session,
        user_id: &str,
        max_turns: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT q.id, q.session_id, q.from_user_id, q.to_user_id, q.content, q.spouse_id, q.created_at,
                    a.id, a.session_id, a.from_user_id, a.to_user_id, a.content, a.spouse_id, a.created_at
             FROM messages q
             JOIN messages a ON a.id = q.spouse_id AND a.spouse_id = q.id
             WHERE q.session_id = ?1 AND q.from_user_id = ?2 AND a.to_user_id = ?2
             ORDER BY q.created_at DESC, q.id DESC
             LIMIT ?3",
        )?;
        let limit = i64::try_from(max_turns).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![session.id.0 as i64, user_id, limit], |row| {
            Ok((message_from_row(row, 0)?, message_from_row(row, 7)?))
        })?;

        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        pairs.reverse();
        Ok(pairs
            .into_iter()
            .flat_map(|(question, answer)| [question, answer])
            .collect())
    }
}

fn to_micros(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn from_micros(micros: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_micros(micros.max(0) as u64)
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    let state: String = row.get(2)?;
    Ok(Session {
        id: SessionId(row.get::<_, i64>(0)? as u64),
        user_id: row.get(1)?,
        state: match state.as_str() {
            "open" => SessionState::Open,
            _ => SessionState::Closed,
        },
        created_at: from_micros(row.get(3)?),
        updated_at: from_micros(row.get(4)?),
        deleted_at: row.get::<_, Option<i64>>(5)?.map(from_micros),
    })
}

/// Read a message from seven columns starting at `offset`.
fn message_from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Message> {
    Ok(Message {
        id: MessageId(row.get::<_, i64>(offset)? as u64),
        session_id: SessionId(row.get::<_, i64>(offset + 1)? as u64),
        from_user_id: row.get(offset + 2)?,
        to_user_id: row.get(offset + 3)?,
        content: row.get(offset + 4)?,
        spouse_id: row
            .get::<_, Option<i64>>(offset + 5)?
            .map(|id| MessageId(id as u64)),
        created_at: from_micros(row.get(offset + 6)?),
    })
}

/// Conversation store persisted in a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Db>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let db = tokio::task::spawn_blocking(move || open_db(&path))
            .await
            .map_err(|e| StoreError::Backend(format!("store open task failed: {e}")))??;
        Ok(Self::from_db(db))
    }

    /// A private in-memory database. Contents are lost on drop.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::from_db(Db::new(Connection::open_in_memory()?)?))
    }

    fn from_db(db: Db) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Db) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut db = db
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))?;
            f(&mut db)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
    }
}

fn open_db(path: &Path) -> Result<Db, StoreError> {
    let db = Db::new(Connection::open(path)?)?;
    info!(path = %path.display(), "Opened conversation database");
    Ok(db)
}

impl ConversationStore for SqliteStore {
    fn create_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Session, StoreError>> {
        let user_id = user_id.to_string();
        Box::pin(self.run(move |db| db.create_session(&user_id)))
    }

    fn close_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let closed = self
                .run(move |db| db.close_sessions(&user_id))
                .await?;
            debug!(closed, "Closed sessions");
            Ok(())
        })
    }

    fn latest_active_session<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Session, StoreError>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            self.run(move |db| db.latest_active_session(&user_id))
                .await?
                .ok_or(StoreError::NotFound)
        })
    }

    fn create_message<'a>(
        &'a self,
        session: &'a Session,
        from_user_id: &'a str,
        to_user_id: &'a str,
        content: &'a str,
    ) -> BoxFuture<'a, Result<Message, StoreError>> {
        let (session, from, to, content) = (
            session.clone(),
            from_user_id.to_string(),
            to_user_id.to_string(),
            content.to_string(),
        );
        Box::pin(self.run(move |db| db.create_message(&session, &from, &to, &content, None)))
    }

    fn create_spouse_message<'a>(
        &'a self,
        session: &'a Session,
        from_user_id: &'a str,
        to_user_id: &'a str,
        content: &'a str,
        spouse: &'a Message,
    ) -> BoxFuture<'a, Result<Message, StoreError>> {
        let (session, from, to, content, spouse) = (
            session.clone(),
            from_user_id.to_string(),
            to_user_id.to_string(),
            content.to_string(),
            spouse.clone(),
        );
        Box::pin(self.run(move |db| db.create_message(&session, &from, &to, &content, Some(&spouse))))
    }

    fn list_latest_paired_messages<'a>(
        &'a self,
        session: &'a Session,
        user_id: &'a str,
        max_turns: usize,
    ) -> BoxFuture<'a, Result<Vec<Message>, StoreError>> {
        let (session, user_id) = (session.clone(), user_id.to_string());
        Box::pin(self.run(move |db| db.list_latest_paired_messages(&session, &user_id, max_turns)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    async fn answered(store: &SqliteStore, session: &Session, q: &str, a: &str) {
        let question = store
            .create_message(session, "alice", "default", q)
            .await
            .unwrap();
        store
            .create_spouse_message(session, "default", "alice", a, &question)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_latest_active_session_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.latest_active_session("alice").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_latest_active_prefers_newest_open() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old = store.create_session("alice").await.unwrap();
        let new = store.create_session("alice").await.unwrap();
        assert!(new.created_at > old.created_at);

        let active = store.latest_active_session("alice").await.unwrap();
        assert_eq!(active, new);
        assert!(store.latest_active_session("bob").await.is_err());
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.close_session("nobody").await.unwrap();

        store.create_session("alice").await.unwrap();
        store.close_session("alice").await.unwrap();
        store.close_session("alice").await.unwrap();
        assert!(store.latest_active_session("alice").await.is_err());
    }

    #[tokio::test]
    async fn test_spouse_rules() {
        let store = SqliteStore::open_in_memory().unwrap();
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

        let answer = store
            .create_spouse_message(&first, "default", "alice", "hello", &question)
            .await
            .unwrap();
        assert_eq!(answer.spouse_id, Some(question.id));

        let err = store
            .create_spouse_message(&first, "default", "alice", "again", &question)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_message_for_unknown_session_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let ghost = Session::open(SessionId(99), "alice", SystemTime::now());
        let err = store
            .create_message(&ghost, "alice", "default", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_list_paired_skips_unanswered_and_limits_turns() {
        let store = SqliteStore::open_in_memory().unwrap();
        let session = store.create_session("alice").await.unwrap();
        for i in 0..3 {
            answered(&store, &session, &format!("q{i}"), &format!("a{i}")).await;
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
        assert_eq!(pairs[0].spouse_id, Some(pairs[1].id));
        assert_eq!(pairs[1].spouse_id, Some(pairs[0].id));
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("threadline.db");

        let store = SqliteStore::open(&path).await.unwrap();
        let session = store.create_session("alice").await.unwrap();
        answered(&store, &session, "what is rust?", "a language").await;
        let last_written = store
            .list_latest_paired_messages(&session, "alice", 1)
            .await
            .unwrap()[1]
            .created_at;
        drop(store);

        let reopened = SqliteStore::open(&path).await.unwrap();
        let active = reopened.latest_active_session("alice").await.unwrap();
        assert_eq!(active, session);

        let pairs = reopened
            .list_latest_paired_messages(&active, "alice", 10)
            .await
            .unwrap();
        let contents: Vec<&str> = pairs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["what is rust?", "a language"]);

        // The clock resumes past everything already written.
        let next = reopened.create_session("bob").await.unwrap();
        assert!(next.id > session.id);
        assert!(next.created_at > last_written);
    }

    #[tokio::test]
    async fn test_cancelled_write_is_committed() {
        let store = SqliteStore::open_in_memory().unwrap();

        let _ = tokio::time::timeout(Duration::ZERO, store.create_session("alice")).await;
        store.create_session("bob").await.unwrap();

        assert!(store.latest_active_session("alice").await.is_ok());
        assert!(store.latest_active_session("bob").await.is_ok());
    }
}
