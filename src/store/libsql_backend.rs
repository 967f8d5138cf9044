//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases over a single shared
//! connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chat::model::{Message, NewMessage, NewThread, Role, Thread};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// Reads share the connection with in-flight transactions, so every call
/// goes through `gate`: reads take it shared, writes take it exclusively.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    gate: RwLock<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Open(format!(
                        "Failed to create database directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Open(format!("Failed to create in-memory database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.init_schema().await?;
        debug!("In-memory database opened");
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Open(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            gate: RwLock::new(()),
        })
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed-width RFC 3339 with microseconds, so text
/// order in SQL is chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(ndt.and_utc());
    }
    None
}

fn text_column(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Read(format!("column {name}: {e}")))
}

fn uuid_column(row: &libsql::Row, idx: i32, name: &str) -> Result<Uuid, DatabaseError> {
    let s = text_column(row, idx, name)?;
    Uuid::parse_str(&s).map_err(|e| DatabaseError::Read(format!("column {name}: {e}")))
}

fn datetime_column(row: &libsql::Row, idx: i32, name: &str) -> Result<DateTime<Utc>, DatabaseError> {
    let s = text_column(row, idx, name)?;
    parse_datetime(&s)
        .ok_or_else(|| DatabaseError::Read(format!("column {name}: bad timestamp {s:?}")))
}

/// Map a libsql Row to a Thread.
///
/// Column order matches THREAD_COLUMNS.
fn row_to_thread(row: &libsql::Row) -> Result<Thread, DatabaseError> {
    Ok(Thread {
        id: uuid_column(row, 0, "id")?,
        title: text_column(row, 1, "title")?,
        created_at: datetime_column(row, 2, "created_at")?,
        updated_at: datetime_column(row, 3, "updated_at")?,
    })
}

/// Map a libsql Row to a Message.
///
/// Column order matches MESSAGE_COLUMNS.
fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let role_str = text_column(row, 2, "role")?;
    let role: Role = role_str
        .parse()
        .map_err(|e: String| DatabaseError::Read(format!("column role: {e}")))?;

    Ok(Message {
        id: uuid_column(row, 0, "id")?,
        thread_id: uuid_column(row, 1, "thread_id")?,
        role,
        content: text_column(row, 3, "content")?,
        thought: text_column(row, 4, "thought")?,
        created_at: datetime_column(row, 5, "created_at")?,
    })
}

// ── Trait implementation ────────────────────────────────────────────

const THREAD_COLUMNS: &str = "id, title, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, thread_id, role, content, thought, created_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.gate.write().await;
        migrations::run_migrations(self.conn()).await
    }

    async fn schema_version(&self) -> Result<i64, DatabaseError> {
        let _guard = self.gate.read().await;
        migrations::current_version(self.conn()).await
    }

    // ── Threads ─────────────────────────────────────────────────────

    async fn insert_thread(&self, thread: &NewThread) -> Result<(), DatabaseError> {
        let _guard = self.gate.write().await;
        let now = format_datetime(&thread.now);
        self.conn()
            .execute(
                "INSERT INTO threads (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![thread.id.to_string(), thread.title.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Write(format!("insert_thread: {e}")))?;

        debug!(id = %thread.id, "Thread inserted into DB");
        Ok(())
    }

    async fn get_thread(&self, id: Uuid) -> Result<Option<Thread>, DatabaseError> {
        let _guard = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {THREAD_COLUMNS} FROM threads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Read(format!("get_thread: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_thread(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Read(format!("get_thread: {e}"))),
        }
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, DatabaseError> {
        let _guard = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM threads ORDER BY updated_at DESC, rowid DESC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Read(format!("list_threads: {e}")))?;

        let mut threads = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Read(format!("list_threads: {e}")))?
        {
            threads.push(row_to_thread(&row)?);
        }
        Ok(threads)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn append_message(&self, message: &NewMessage) -> Result<(), DatabaseError> {
        let _guard = self.gate.write().await;
        let created_at = format_datetime(&message.created_at);
        let thread_id = message.thread_id.to_string();

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Write(format!("append_message: begin: {e}")))?;

        let inserted = tx
            .execute(
                &format!("INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    message.id.to_string(),
                    thread_id.clone(),
                    message.role.as_str(),
                    message.content.as_str(),
                    message.thought.as_str(),
                    created_at.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Write(format!("append_message: insert: {e}")));

        // updated_at never moves backwards, even if the clock does.
        let touched = match inserted {
            Ok(_) => tx
                .execute(
                    "UPDATE threads SET updated_at = MAX(updated_at, ?2) WHERE id = ?1",
                    params![thread_id.clone(), created_at],
                )
                .await
                .map_err(|e| DatabaseError::Write(format!("append_message: touch thread: {e}"))),
            Err(e) => Err(e),
        };

        let result = match touched {
            Ok(1) => Ok(()),
            Ok(_) => Err(DatabaseError::NotFound {
                entity: "thread".to_string(),
                id: thread_id.clone(),
            }),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!(thread_id = %thread_id, error = %e, "Rolling back message append");
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "Rollback failed");
            }
            return Err(e);
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Write(format!("append_message: commit: {e}")))?;

        debug!(id = %message.id, thread_id = %thread_id, "Message appended to DB");
        Ok(())
    }

    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let _guard = self.gate.read().await;
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE thread_id = ?1 ORDER BY created_at ASC, rowid ASC"
                ),
                params![thread_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Read(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Read(format!("list_messages: {e}")))?
        {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::{Duration, SubsecRound};

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    fn new_thread(title: &str, at: DateTime<Utc>) -> NewThread {
        NewThread {
            id: Uuid::new_v4(),
            title: title.to_string(),
            now: at,
        }
    }

    fn new_message(thread_id: Uuid, content: &str, at: DateTime<Utc>) -> NewMessage {
        NewMessage {
            id: Uuid::new_v4(),
            thread_id,
            role: Role::User,
            content: content.to_string(),
            thought: String::new(),
            created_at: at,
        }
    }

    // ── Thread tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_thread() {
        let db = test_db().await;
        let at = now();
        let thread = new_thread("Trip planning", at);
        db.insert_thread(&thread).await.unwrap();

        let loaded = db.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, thread.id);
        assert_eq!(loaded.title, "Trip planning");
        assert_eq!(loaded.created_at, at);
        assert_eq!(loaded.updated_at, at);
    }

    #[tokio::test]
    async fn get_thread_not_found() {
        let db = test_db().await;
        assert!(db.get_thread(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_thread_id_is_a_write_error() {
        let db = test_db().await;
        let thread = new_thread("a", now());
        db.insert_thread(&thread).await.unwrap();

        let err = db.insert_thread(&thread).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Write(_)));
    }

    #[tokio::test]
    async fn list_threads_newest_activity_first() {
        let db = test_db().await;
        let base = now();
        let old = new_thread("old", base);
        let mid = new_thread("mid", base + Duration::seconds(1));
        let new = new_thread("new", base + Duration::seconds(2));
        db.insert_thread(&mid).await.unwrap();
        db.insert_thread(&new).await.unwrap();
        db.insert_thread(&old).await.unwrap();

        let titles: Vec<_> = db
            .list_threads()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.title)
            .collect();
        assert_eq!(titles, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn list_threads_ties_break_newest_insert_first() {
        let db = test_db().await;
        let at = now();
        let first = new_thread("first", at);
        let second = new_thread("second", at);
        db.insert_thread(&first).await.unwrap();
        db.insert_thread(&second).await.unwrap();

        let threads = db.list_threads().await.unwrap();
        assert_eq!(threads[0].id, second.id);
        assert_eq!(threads[1].id, first.id);
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn append_touches_thread() {
        let db = test_db().await;
        let base = now();
        let thread = new_thread("t", base);
        db.insert_thread(&thread).await.unwrap();

        let later = base + Duration::seconds(5);
        db.append_message(&new_message(thread.id, "hi", later))
            .await
            .unwrap();

        let loaded = db.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(loaded.created_at, base);
        assert_eq!(loaded.updated_at, later);
    }

    #[tokio::test]
    async fn append_never_moves_updated_at_backwards() {
        let db = test_db().await;
        let base = now();
        let thread = new_thread("t", base);
        db.insert_thread(&thread).await.unwrap();

        db.append_message(&new_message(thread.id, "skewed", base - Duration::seconds(30)))
            .await
            .unwrap();

        let loaded = db.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(loaded.updated_at, base);
    }

    #[tokio::test]
    async fn append_to_missing_thread_writes_nothing() {
        let db = test_db().await;
        let ghost = Uuid::new_v4();

        let err = db
            .append_message(&new_message(ghost, "orphan", now()))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { ref entity, .. } if entity == "thread"));
        assert!(db.list_messages(ghost).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_messages_filters_and_orders() {
        let db = test_db().await;
        let base = now();
        let a = new_thread("a", base);
        let b = new_thread("b", base);
        db.insert_thread(&a).await.unwrap();
        db.insert_thread(&b).await.unwrap();

        db.append_message(&new_message(a.id, "a2", base + Duration::seconds(2)))
            .await
            .unwrap();
        db.append_message(&new_message(b.id, "b1", base + Duration::seconds(1)))
            .await
            .unwrap();
        db.append_message(&new_message(a.id, "a1", base + Duration::seconds(1)))
            .await
            .unwrap();

        let contents: Vec<_> = db
            .list_messages(a.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["a1", "a2"]);
        assert_eq!(db.list_messages(b.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_messages_same_timestamp_keeps_insert_order() {
        let db = test_db().await;
        let at = now();
        let thread = new_thread("t", at);
        db.insert_thread(&thread).await.unwrap();

        for content in ["one", "two", "three"] {
            db.append_message(&new_message(thread.id, content, at))
                .await
                .unwrap();
        }

        let contents: Vec<_> = db
            .list_messages(thread.id)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn message_fields_roundtrip() {
        let db = test_db().await;
        let at = now();
        let thread = new_thread("t", at);
        db.insert_thread(&thread).await.unwrap();

        let msg = NewMessage {
            id: Uuid::new_v4(),
            thread_id: thread.id,
            role: Role::Assistant,
            content: "Try Japan.".to_string(),
            thought: "considered budget and season".to_string(),
            created_at: at,
        };
        db.append_message(&msg).await.unwrap();

        let loaded = &db.list_messages(thread.id).await.unwrap()[0];
        assert_eq!(loaded.id, msg.id);
        assert_eq!(loaded.thread_id, thread.id);
        assert_eq!(loaded.role, Role::Assistant);
        assert_eq!(loaded.content, "Try Japan.");
        assert_eq!(loaded.thought, "considered budget and season");
        assert_eq!(loaded.created_at, at);
    }

    #[tokio::test]
    async fn failed_thread_touch_rolls_back_insert() {
        let db = test_db().await;
        let thread = new_thread("t", now());
        db.insert_thread(&thread).await.unwrap();

        db.conn()
            .execute(
                "CREATE TRIGGER fail_touch BEFORE UPDATE ON threads
                 BEGIN SELECT RAISE(ABORT, 'simulated failure'); END",
                (),
            )
            .await
            .unwrap();

        let err = db
            .append_message(&new_message(thread.id, "lost", now()))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Write(_)));
        assert!(db.list_messages(thread.id).await.unwrap().is_empty());

        // Connection is usable again once the trigger is gone.
        db.conn()
            .execute("DROP TRIGGER fail_touch", ())
            .await
            .unwrap();
        db.append_message(&new_message(thread.id, "kept", now()))
            .await
            .unwrap();
        assert_eq!(db.list_messages(thread.id).await.unwrap().len(), 1);
    }

    // ── Decoding tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn corrupt_role_is_a_read_error() {
        let db = test_db().await;
        let thread = new_thread("t", now());
        db.insert_thread(&thread).await.unwrap();
        db.conn()
            .execute(
                "INSERT INTO messages (id, thread_id, role, content, thought, created_at)
                 VALUES (?1, ?2, 'system', 'x', '', '2026-01-01T00:00:00.000000Z')",
                params![Uuid::new_v4().to_string(), thread.id.to_string()],
            )
            .await
            .unwrap();

        let err = db.list_messages(thread.id).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Read(_)));
    }

    #[test]
    fn parse_datetime_accepts_sqlite_format() {
        let dt = parse_datetime("2026-01-02 03:04:05").unwrap();
        assert_eq!(format_datetime(&dt), "2026-01-02T03:04:05.000000Z");
        assert!(parse_datetime("yesterday").is_none());
    }

    #[test]
    fn formatted_datetimes_sort_chronologically() {
        let a = now();
        let b = a + Duration::microseconds(1);
        assert!(format_datetime(&a) < format_datetime(&b));
    }

    // ── Migration tests ─────────────────────────────────────────────

    #[tokio::test]
    async fn open_in_memory_reports_latest_version() {
        let db = test_db().await;
        assert_eq!(
            db.schema_version().await.unwrap(),
            migrations::latest_version()
        );
    }

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let db = test_db().await;
        db.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn new_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("nested").join("dir").join("chat.db");
        let db = LibSqlBackend::new_local(&db_path).await.unwrap();
        assert!(db_path.exists());
        drop(db);
    }
}
