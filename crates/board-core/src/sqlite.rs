//! SQLite-backed message store.
//!
//! A single connection is owned by the store and guarded by a mutex. Each
//! operation takes the lock for its own duration on tokio's blocking pool,
//! so operations are serialized and never block the async workers.

use crate::store::{validate_text, Store, StoreError, DEFAULT_MAX_TEXT_LENGTH};
use async_trait::async_trait;
use board_protocol::message::{format_timestamp, parse_timestamp};
use board_protocol::{Message, MessageId};
use chrono::{SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, trace};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        text TEXT NOT NULL,
        created_at TEXT NOT NULL
    );
";

/// A [`Store`] persisting messages in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    max_text_length: usize,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // WAL keeps readers off the writer's back; FULL fsyncs every commit
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        info!(path = %path.display(), journal_mode = %mode, "Opened message store");
        Self::init(conn)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_text_length: DEFAULT_MAX_TEXT_LENGTH,
        })
    }

    /// Set the maximum accepted message length, in characters.
    #[must_use]
    pub fn with_max_text_length(mut self, max: usize) -> Self {
        self.max_text_length = max;
        self
    }

    /// Get the maximum accepted message length.
    #[must_use]
    pub fn max_text_length(&self) -> usize {
        self.max_text_length
    }

    /// Run `f` with exclusive access to the connection.
    async fn with_conn<F, T>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let start = Instant::now();

        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?;

        trace!(op, elapsed_us = start.elapsed().as_micros() as u64, "Store operation");
        result
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert(&self, text: &str) -> Result<Message, StoreError> {
        let text = validate_text(text, self.max_text_length)?.to_owned();

        let message = self
            .with_conn("insert", move |conn| {
                // Stored with microsecond precision, so drop the rest up front
                let created_at = Utc::now().trunc_subsecs(6);

                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO messages (text, created_at) VALUES (?1, ?2)",
                    params![text, format_timestamp(&created_at)],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;

                Ok(Message::new(id, text, created_at))
            })
            .await?;

        debug!(id = message.id, "Inserted message");
        Ok(message)
    }

    async fn delete(&self, id: MessageId) -> Result<bool, StoreError> {
        let removed = self
            .with_conn("delete", move |conn| {
                let rows = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
                Ok(rows > 0)
            })
            .await?;

        debug!(id, removed, "Deleted message");
        Ok(removed)
    }

    async fn list_all(&self) -> Result<Vec<Message>, StoreError> {
        self.with_conn("list_all", |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT id, text, created_at FROM messages ORDER BY id ASC")?;

            let rows = stmt.query_map([], |row| {
                let created_at: String = row.get(2)?;
                let created_at = parse_timestamp(&created_at).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                })?;
                Ok(Message::new(row.get(0)?, row.get::<_, String>(1)?, created_at))
            })?;

            let messages = rows.collect::<Result<Vec<_>, _>>()?;
            Ok(messages)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ValidationError;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let store = store();

        let a = store.insert("a").await.unwrap();
        let b = store.insert("b").await.unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.text, "a");
        assert!(b.created_at >= a.created_at);
    }

    #[tokio::test]
    async fn test_insert_stores_trimmed_text() {
        let store = store();

        let msg = store.insert("  hello  ").await.unwrap();
        assert_eq!(msg.text, "hello");
        assert_eq!(store.list_all().await.unwrap(), vec![msg]);
    }

    #[tokio::test]
    async fn test_insert_rejects_blank_text() {
        let store = store();

        for text in ["", "   ", "\n\t"] {
            assert!(matches!(
                store.insert(text).await,
                Err(StoreError::Validation(ValidationError::Empty))
            ));
        }
        assert!(store.list_all().await.unwrap().is_empty());

        // Rejected posts do not consume ids
        assert_eq!(store.insert("first").await.unwrap().id, 1);
    }

    #[tokio::test]
    async fn test_insert_rejects_long_text() {
        let store = store().with_max_text_length(3);

        assert!(matches!(
            store.insert("abcd").await,
            Err(StoreError::Validation(ValidationError::TooLong { len: 4, max: 3 }))
        ));
        assert!(store.insert("abc").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = store();
        let msg = store.insert("bye").await.unwrap();

        assert!(store.delete(msg.id).await.unwrap());
        assert!(!store.delete(msg.id).await.unwrap());
        assert!(!store.delete(999).await.unwrap());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ids_not_reused_after_delete() {
        let store = store();

        let a = store.insert("a").await.unwrap();
        let b = store.insert("b").await.unwrap();
        store.delete(b.id).await.unwrap();
        store.delete(a.id).await.unwrap();

        let c = store.insert("c").await.unwrap();
        assert_eq!(c.id, 3);
    }

    #[tokio::test]
    async fn test_list_all_reflects_inserts_and_deletes() {
        let store = store();

        let a = store.insert("a").await.unwrap();
        let b = store.insert("b").await.unwrap();
        store.delete(a.id).await.unwrap();
        let c = store.insert("c").await.unwrap();

        let listed = store.list_all().await.unwrap();
        assert_eq!(listed, vec![b, c]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_get_distinct_ids() {
        const N: i64 = 64;
        let store = Arc::new(store());

        let handles: Vec<_> = (0..N)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.insert(&format!("msg-{i}")).await.unwrap().id })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.sort_unstable();

        assert_eq!(ids, (1..=N).collect::<Vec<_>>());

        let listed: Vec<_> = store.list_all().await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(listed, ids);
    }

    #[tokio::test]
    async fn test_reopen_keeps_messages_and_retires_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert("kept").await.unwrap();
            let gone = store.insert("gone").await.unwrap();
            store.delete(gone.id).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let listed = store.list_all().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].text, "kept");

        // The deleted highest id stays retired across restarts
        assert_eq!(store.insert("next").await.unwrap().id, 3);
    }
}
