//! Ordered key/value persistence on SQLite.
//!
//! The daemon keeps a single database under `<home>/db/` with one `kv`
//! table. Typed views over a key prefix are exposed as [`Collection`]s;
//! job manifests live under the `jobs:` prefix with JSON values.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database closed")]
    Closed,
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A single-file ordered key/value store.
pub struct Store {
    conn: Mutex<Option<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> StoreResult<Store> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// An in-memory store for ephemeral sessions and tests.
    pub fn open_in_memory() -> StoreResult<Store> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Store> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value BLOB NOT NULL)",
            [],
        )?;
        Ok(Store {
            conn: Mutex::new(Some(conn)),
        })
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        match self.conn.lock().unwrap().as_ref() {
            Some(conn) => f(conn),
            None => Err(StoreError::Closed),
        }
    }

    /// Close the underlying database; later operations fail with
    /// [`StoreError::Closed`]. Idempotent.
    pub fn close(&self) {
        if let Some(conn) = self.conn.lock().unwrap().take() {
            let _ = conn.close();
        }
    }

    pub fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    /// Insert only if absent; returns whether the row was created.
    pub fn insert(&self, key: &str, value: &[u8]) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn upper_bound(prefix: &str) -> String {
        format!("{prefix}\u{10FFFF}")
    }

    /// Visit every `(key, value)` under a prefix in key order. The callback
    /// returns false to stop early.
    pub fn range(
        &self,
        prefix: &str,
        mut f: impl FnMut(&str, &[u8]) -> bool,
    ) -> StoreResult<()> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key")?;
            let mut rows = stmt.query(params![prefix, Self::upper_bound(prefix)])?;
            while let Some(row) = rows.next()? {
                let key: String = row.get(0)?;
                let value: Vec<u8> = row.get(1)?;
                if !f(&key, &value) {
                    break;
                }
            }
            Ok(())
        })
    }

    pub fn count(&self, prefix: &str) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM kv WHERE key >= ?1 AND key < ?2",
                params![prefix, Self::upper_bound(prefix)],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    pub fn clear(&self, prefix: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kv WHERE key >= ?1 AND key < ?2",
                params![prefix, Self::upper_bound(prefix)],
            )?;
            Ok(())
        })
    }
}

/// A typed, JSON-encoded view over one key prefix of a [`Store`].
pub struct Collection<T> {
    store: Arc<Store>,
    prefix: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Collection<T> {
    pub fn open(store: Arc<Store>, prefix: &str) -> Collection<T> {
        Collection {
            store,
            prefix: format!("{prefix}:"),
            _marker: PhantomData,
        }
    }

    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub fn replace(&self, id: &str, value: &T) -> StoreResult<()> {
        self.store.put(&self.key(id), &serde_json::to_vec(value)?)
    }

    pub fn insert(&self, id: &str, value: &T) -> StoreResult<bool> {
        self.store.insert(&self.key(id), &serde_json::to_vec(value)?)
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<T>> {
        match self.store.get(&self.key(id))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, id: &str) -> StoreResult<()> {
        self.store.delete(&self.key(id))
    }

    pub fn count(&self) -> StoreResult<usize> {
        self.store.count(&self.prefix)
    }

    pub fn clear(&self) -> StoreResult<()> {
        self.store.clear(&self.prefix)
    }

    /// Visit every entry; undecodable rows are skipped.
    pub fn range(&self, mut f: impl FnMut(String, T) -> bool) -> StoreResult<()> {
        let plen = self.prefix.len();
        self.store.range(&self.prefix, |key, value| {
            match serde_json::from_slice::<T>(value) {
                Ok(item) => f(key[plen..].to_string(), item),
                Err(_) => true,
            }
        })
    }
}
