//! SQLite backend.
//!
//! Each named store is a table `kv_<name>(key TEXT PRIMARY KEY, value BLOB)`
//! in one database file. rusqlite is synchronous, so every call runs on the
//! blocking pool.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;

use kura_cas::{Backend, CasError, CasResult, KvStore};

fn backend_err(e: rusqlite::Error) -> CasError {
    CasError::backend(e.to_string())
}

/// Table name for a store. Anything outside `[A-Za-z0-9_]` becomes `_`.
fn table_name(store: &str) -> String {
    let clean: String = store
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("kv_{clean}")
}

/// SQLite-backed [`Backend`].
#[derive(Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> CasResult<Self> {
        let conn = Connection::open(path).map_err(backend_err)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(backend_err)?;
        Ok(Self::from_connection(conn))
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> CasResult<Self> {
        let conn = Connection::open_in_memory().map_err(backend_err)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn open_store(&self, name: &str) -> CasResult<Arc<dyn KvStore>> {
        let store = SqliteStore {
            conn: self.conn.clone(),
            table: table_name(name),
        };
        store
            .run(|conn, table| {
                conn.execute_batch(&format!(
                    "CREATE TABLE IF NOT EXISTS {table} (key TEXT PRIMARY KEY, value BLOB NOT NULL);"
                ))
            })
            .await?;
        tracing::debug!(store = name, table = %store.table, "opened sqlite store");
        Ok(Arc::new(store))
    }
}

/// One table of a [`SqliteBackend`].
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    table: String,
}

impl SqliteStore {
    async fn run<F, R>(&self, f: F) -> CasResult<R>
    where
        F: FnOnce(&Connection, &str) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        let table = self.table.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn, &table)
        })
        .await
        .map_err(|e| CasError::backend(format!("spawn_blocking: {e}")))?
        .map_err(backend_err)
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> CasResult<Option<Vec<u8>>> {
        let key = key.to_string();
        self.run(move |conn, table| {
            conn.query_row(
                &format!("SELECT value FROM {table} WHERE key = ?1"),
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
        .await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> CasResult<()> {
        let key = key.to_string();
        self.run(move |conn, table| {
            conn.execute(
                &format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?1, ?2)"),
                params![key, value],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> CasResult<()> {
        let key = key.to_string();
        self.run(move |conn, table| {
            conn.execute(&format!("DELETE FROM {table} WHERE key = ?1"), params![key])
                .map(|_| ())
        })
        .await
    }

    async fn keys(&self) -> CasResult<Vec<String>> {
        self.run(|conn, table| {
            let mut stmt = conn.prepare(&format!("SELECT key FROM {table} ORDER BY key"))?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn entries(&self) -> CasResult<Vec<(String, Vec<u8>)>> {
        self.run(|conn, table| {
            let mut stmt = conn.prepare(&format!("SELECT key, value FROM {table} ORDER BY key"))?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
        .await
    }

    async fn has(&self, key: &str) -> CasResult<bool> {
        let key = key.to_string();
        self.run(move |conn, table| {
            conn.query_row(
                &format!("SELECT 1 FROM {table} WHERE key = ?1"),
                params![key],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
        })
        .await
    }
}
