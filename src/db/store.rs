//! SQLite key-value store for the session snapshot.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Snapshot writer error: {0}")]
    Writer(#[from] std::io::Error),
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Flat key-value store owned by a single session store.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::init(Connection::open(path)?)
    }

    /// A throwaway store, for tests and for running without a snapshot file.
    pub fn in_memory() -> Result<Self, DbError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(Self { conn })
    }

    /// Fetch the value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<String>, DbError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Insert or overwrite the value stored under `key`.
    pub fn put(&self, key: &str, value: &str) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
            params![key, value, Utc::now().format(TIME_FORMAT).to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use tempfile::NamedTempFile;

    #[test]
    fn test_put_overwrites() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        assert_eq!(store.get("k").unwrap(), None);
        store.put("k", "one").unwrap();
        store.put("k", "two").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("two"));

        let written: String = store
            .conn
            .query_row("SELECT updated_at FROM kv WHERE key = 'k'", [], |row| row.get(0))
            .unwrap();
        assert!(NaiveDateTime::parse_from_str(&written, TIME_FORMAT).is_ok());
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let store = Store::new(tmp.path()).unwrap();
            store.put("snapshot", "{}").unwrap();
        }
        let reopened = Store::new(tmp.path()).unwrap();
        assert_eq!(reopened.get("snapshot").unwrap().as_deref(), Some("{}"));
    }
}
