//! Durable conversation store backed by a single JSON document.
//!
//! Each write is applied to a copy of the in-memory [`Ledger`], written to a
//! sibling temp file, synced, and renamed over the document. Only after the
//! rename succeeds does the in-memory copy advance.
//!
//! The disk write and the in-memory commit run together on a blocking task
//! that owns the ledger lock. Dropping the caller's future cannot separate
//! them: a write that reached the disk is always committed in memory too, and
//! a failed write leaves both unchanged.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::BoxFuture;
use crate::model::{Message, Session};

use super::memory::Ledger;
use super::{ConversationStore, StoreError};

/// Conversation store persisted to a JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    ledger: Arc<Mutex<Ledger>>,
}

impl JsonFileStore {
    /// Open the document at `path`, starting empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let ledger = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Conversation store not found, starting empty");
                Ledger::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            ledger: Arc::new(Mutex::new(ledger)),
        })
    }

    /// Location of the backing document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every message, in creation order.
    pub async fn messages(&self) -> Vec<Message> {
        self.ledger.lock().await.messages().to_vec()
    }

    async fn read<T>(&self, f: impl FnOnce(&Ledger) -> T) -> T {
        let ledger = self.ledger.lock().await;
        f(&ledger)
    }

    async fn write<T>(
        &self,
        f: impl FnOnce(&mut Ledger) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let ledger = Arc::clone(&self.ledger).lock_owned().await;
        let mut next = Ledger::clone(&ledger);
        let out = f(&mut next)?;
        let bytes = serde_json::to_vec_pretty(&next)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || commit(ledger, next, &path, &bytes))
            .await
            .map_err(|e| StoreError::Backend(format!("store write task failed: {e}")))??;
        Ok(out)
    }
}

/// Persist `next`, then install it as the in-memory ledger.
fn commit(
    mut ledger: OwnedMutexGuard<Ledger>,
    next: Ledger,
    path: &Path,
    bytes: &[u8],
) -> Result<(), StoreError> {
    persist(path, bytes)?;
    *ledger = next;
    debug!(path = %path.display(), bytes = bytes.len(), "Conversation store written");
    Ok(())
}

fn persist(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.to_path_buf().into_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = std::fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    std::fs::rename(&tmp, path)
}

impl ConversationStore for JsonFileStore {
    fn create_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Session, StoreError>> {
        Box::pin(async move { self.write(|l| Ok(l.create_session(user_id))).await })
    }

    fn close_session<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            // Skip the rewrite entirely when nothing is open.
            if self.read(|l| l.latest_active_session(user_id)).await.is_none() {
                return Ok(());
            }
            self.write(|l| {
                l.close_sessions(user_id);
                Ok(())
            })
            .await
        })
    }

    fn latest_active_session<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Session, StoreError>> {
        Box::pin(async move {
            self.read(|l| l.latest_active_session(user_id))
                .await
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
        Box::pin(async move {
            self.write(|l| l.create_message(session, from_user_id, to_user_id, content, None))
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
            self.write(|l| l.create_message(session, from_user_id, to_user_id, content, Some(spouse)))
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
            Ok(self
                .read(|l| l.list_latest_paired_messages(session, user_id, max_turns))
                .await)
        })
    }
}
