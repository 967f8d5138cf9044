//! Backend-agnostic `Database` trait — single async interface for chat persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::chat::model::{Message, NewMessage, NewThread, Thread};
use crate::error::DatabaseError;

/// Storage operations behind [`ChatStore`](crate::chat::ChatStore).
///
/// Records arrive fully stamped; implementations persist exactly the ids and
/// timestamps they are given.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Highest applied schema version.
    async fn schema_version(&self) -> Result<i64, DatabaseError>;

    // ── Threads ─────────────────────────────────────────────────────

    /// Insert a new thread with `created_at = updated_at = thread.now`.
    async fn insert_thread(&self, thread: &NewThread) -> Result<(), DatabaseError>;

    /// Get a thread by ID.
    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError>;

    /// All threads, most recently updated first.
    async fn list_threads(&self) -> Result<Vec<Thread>, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Insert a message and move its thread's `updated_at` to the message's
    /// `created_at`, atomically.
    ///
    /// Fails with [`DatabaseError::NotFound`] and writes nothing if the
    /// thread does not exist.
    async fn append_message(&self, message: &NewMessage) -> Result<(), DatabaseError>;

    /// Messages of a thread, oldest first. Empty if none match.
    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, DatabaseError>;
}
