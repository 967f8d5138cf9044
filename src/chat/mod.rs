//! Thread and message persistence for the chat UI.
//!
//! `ChatStore` owns id generation and timestamping; the [`Database`] behind
//! it only persists what it is handed. Construct one per database and pass
//! it where it is needed.

pub mod model;

use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::{StoreConfig, StoreLocation};
use crate::error::Result;
use crate::store::{Database, LibSqlBackend};

pub use model::{Message, NewMessage, NewThread, Role, Thread};

/// Repository for conversation threads and their messages.
#[derive(Clone)]
pub struct ChatStore {
    db: Arc<dyn Database>,
}

impl ChatStore {
    /// Wrap an already-opened backend.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Open the database described by `config` and bring its schema up to date.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let backend = match &config.location {
            StoreLocation::File(path) => LibSqlBackend::new_local(path).await?,
            StoreLocation::Memory => LibSqlBackend::new_memory().await?,
        };
        Ok(Self::new(Arc::new(backend)))
    }

    /// Release this handle. The database closes once no clone is left.
    pub fn close(self) {
        drop(self);
    }

    /// Highest applied schema version.
    pub async fn schema_version(&self) -> Result<i64> {
        Ok(self.db.schema_version().await?)
    }

    /// Create a thread and return its id. `created_at` and `updated_at` are
    /// both set to the current time.
    pub async fn create_thread(&self, title: &str) -> Result<Uuid> {
        let thread = NewThread {
            id: Uuid::new_v4(),
            title: title.to_string(),
            now: now(),
        };
        self.db.insert_thread(&thread).await?;
        debug!(thread_id = %thread.id, "Created thread");
        Ok(thread.id)
    }

    /// All threads, most recently active first.
    pub async fn get_threads(&self) -> Result<Vec<Thread>> {
        Ok(self.db.list_threads().await?)
    }

    /// A single thread, if it exists.
    pub async fn get_thread(&self, thread_id: Uuid) -> Result<Option<Thread>> {
        Ok(self.db.get_thread(thread_id).await?)
    }

    /// Append a message to a thread and refresh the thread's `updated_at`.
    ///
    /// Both writes commit together. Appending to an unknown thread fails with
    /// `DatabaseError::NotFound` and leaves the database unchanged.
    pub async fn create_message(
        &self,
        thread_id: Uuid,
        role: Role,
        content: &str,
        thought: &str,
    ) -> Result<()> {
        let message = NewMessage {
            id: Uuid::new_v4(),
            thread_id,
            role,
            content: content.to_string(),
            thought: thought.to_string(),
            created_at: now(),
        };
        self.db.append_message(&message).await?;
        debug!(message_id = %message.id, thread_id = %thread_id, role = %role, "Created message");
        Ok(())
    }

    /// Messages of a thread, oldest first. Empty if the thread has none.
    pub async fn get_messages_for_thread(&self, thread_id: Uuid) -> Result<Vec<Message>> {
        Ok(self.db.list_messages(thread_id).await?)
    }
}

/// Current time at the precision the store persists.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
