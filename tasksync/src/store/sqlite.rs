//! `SQLite`-backed [`Storage`] for durable client-side persistence.
//!
//! All namespaces share one `records` table. Every row carries an
//! autoincrement `seq` so that [`Storage::scan`] returns records in their
//! original insertion order; overwrites use `ON CONFLICT DO UPDATE`, which
//! updates the row in place and keeps its `seq`.
//!
//! # Concurrency
//!
//! `rusqlite` is synchronous. Every call locks the connection and runs on
//! [`tokio::task::spawn_blocking`] so the async executor is never stalled.
//! The lock is never held across an await point.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::{Namespace, Storage, StoreError, WriteBatch, WriteOp};

/// Schema for the record table. Migration-safe: uses `IF NOT EXISTS`.
const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS records (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        ns TEXT NOT NULL,
        key TEXT NOT NULL,
        value BLOB NOT NULL,
        UNIQUE(ns, key)
    );
";

/// Single-file `SQLite` store.
#[derive(Clone)]
pub struct SqliteStorage {
    /// Synchronization protocol: acquire lock, execute SQL, release lock.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Opens (or creates) the database at `path`.
    ///
    /// Parent directories are created if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the file cannot be opened or
    /// the schema cannot be initialised.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("cannot open {}: {e}", path.display())))?;
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database (lost when dropped).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if `SQLite` initialisation fails.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| StoreError::Unavailable(format!("schema init failed: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("storage worker failed: {e}")))?
    }
}

impl Storage for SqliteStorage {
    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT key, value FROM records WHERE ns = ?1 ORDER BY seq")
                .map_err(|e| StoreError::ReadFailed(e.to_string()))?;
            let rows = stmt
                .query_map(params![ns.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| StoreError::ReadFailed(e.to_string()))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::ReadFailed(e.to_string()))
        })
        .await
    }

    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM records WHERE ns = ?1 AND key = ?2",
                params![ns.as_str(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::ReadFailed(e.to_string()))
        })
        .await
    }

    async fn write_batch(&self, ns: Namespace, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.with_conn(move |conn| {
            let write_err = |e: rusqlite::Error| StoreError::WriteFailed(e.to_string());
            let tx = conn.transaction().map_err(write_err)?;
            if batch.clear {
                tx.execute("DELETE FROM records WHERE ns = ?1", params![ns.as_str()])
                    .map_err(write_err)?;
            }
            for op in &batch.ops {
                match op {
                    WriteOp::Put(key, value) => {
                        tx.execute(
                            "INSERT INTO records (ns, key, value) VALUES (?1, ?2, ?3)
                             ON CONFLICT(ns, key) DO UPDATE SET value = excluded.value",
                            params![ns.as_str(), key, value],
                        )
                        .map_err(write_err)?;
                    }
                    WriteOp::Delete(key) => {
                        tx.execute(
                            "DELETE FROM records WHERE ns = ?1 AND key = ?2",
                            params![ns.as_str(), key],
                        )
                        .map_err(write_err)?;
                    }
                }
            }
            tx.commit().map_err(write_err)
        })
        .await
    }
}
