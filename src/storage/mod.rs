pub mod sqlite;

use std::sync::Arc;

use crate::{
    config::{StorageConfig, create_parent_dir, resolve_path},
    models::{FilterSession, Message, Session},
};
use async_trait::async_trait;
use eyre::Result;
use sqlite::Sqlite;

/// Durable home of sessions and their ordered messages.
///
/// Every write is atomic at session granularity.
#[async_trait]
pub trait Storage {
    /// Session with its messages, ordered by `message_idx`.
    async fn get_session(&self, id: &str) -> Result<Option<Session>>;
    /// Sessions matching `filter`, most recently updated first.
    async fn get_sessions(&self, filter: FilterSession) -> Result<Vec<Session>>;
    async fn get_messages(&self, session_id: &str) -> Result<Vec<Message>>;
    async fn upsert_session(&self, session: Session) -> Result<()>;
    /// Removes the session and its messages. Returns whether it existed.
    async fn delete_session(&self, id: &str) -> Result<bool>;
    /// Writes the final state of the trailing message and advances the
    /// session `updated_at`, in one transaction.
    ///
    /// `message_idx` must either replace the current last message or
    /// append right after it. `title` is only applied when the session has
    /// none yet. Returns `false` when the session no longer exists.
    async fn commit_message(
        &self,
        session_id: &str,
        message: Message,
        title: Option<String>,
    ) -> Result<bool>;
    /// Removes and returns the trailing message, if any.
    async fn delete_last_message(&self, session_id: &str) -> Result<Option<Message>>;
}

pub type ArcStorage = Arc<dyn Storage + Send + Sync>;

pub async fn new_storage(config: &StorageConfig) -> Result<ArcStorage> {
    let storage = match config {
        StorageConfig::Sqlite(sqlite_config) => {
            let path = match sqlite_config.path() {
                Some(path) => {
                    let path = resolve_path(path)?;
                    create_parent_dir(&path)?;
                    Some(path)
                }
                None => None,
            };
            Arc::new(Sqlite::new(path.as_deref()).await?)
        }
    };
    Ok(storage)
}
