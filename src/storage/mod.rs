//! Durable Storage Module - Key-Value Persistence
//!
//! Shared passive storage behind the cache layer. Values are opaque
//! JSON-encoded strings; encoding/decoding is the caller's concern.
//!
//! Implementations:
//! - `SqliteStore`: SQLite-backed persistent store (production)
//! - `MemoryStore`: in-memory HashMap store (tests, ephemeral sessions)

use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, RwLock};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Opaque string key-value storage.
///
/// Each cache binding owns its key exclusively; two bindings writing the
/// same key is a caller error, not handled here.
pub trait KeyValueStore: Send + Sync {
    /// Read the stored value for `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key`, replacing any prior value.
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite-backed key-value store.
///
/// Single `kv` table, one row per key. A single shared connection behind a
/// mutex is sufficient: readers are point-in-time and writers never contend
/// on the same key.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory SQLite store (useful for tests).
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3
            "#,
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-memory key-value store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let entries = self.entries.read().map_err(|_| StorageError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write().map_err(|_| StorageError::Poisoned)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();

        assert!(store.get("missing").unwrap().is_none());

        store.set("k1", r#"{"count":3}"#).unwrap();
        assert_eq!(store.get("k1").unwrap(), Some(r#"{"count":3}"#.to_string()));

        // Overwrite
        store.set("k1", r#"{"count":4}"#).unwrap();
        assert_eq!(store.get("k1").unwrap(), Some(r#"{"count":4}"#.to_string()));
    }

    #[test]
    fn test_sqlite_store_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();

        assert!(store.get("missing").unwrap().is_none());

        store.set("weather", r#"{"temp":21}"#).unwrap();
        assert_eq!(
            store.get("weather").unwrap(),
            Some(r#"{"temp":21}"#.to_string())
        );

        store.set("weather", r#"{"temp":19}"#).unwrap();
        assert_eq!(
            store.get("weather").unwrap(),
            Some(r#"{"temp":19}"#.to_string())
        );
    }

    #[test]
    fn test_sqlite_store_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atlas-cache.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("stats", r#"{"open_tasks":12}"#).unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("stats").unwrap(),
            Some(r#"{"open_tasks":12}"#.to_string())
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryStore::new();
        store.set("a", "1").unwrap();
        store.set("b", "2").unwrap();

        assert_eq!(store.get("a").unwrap(), Some("1".to_string()));
        assert_eq!(store.get("b").unwrap(), Some("2".to_string()));
    }
}
