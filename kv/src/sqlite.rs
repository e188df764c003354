//! SQLite storage backend
//!
//! Each surface maps to its own table, values stored as JSON text and blob
//! payloads as raw bytes. A single connection behind a mutex serializes
//! access; batch operations run inside one transaction so they cost one
//! round trip to the database.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::protocol::{Storage, StoreError, StoreResult, Value};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persistent (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS volatile (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS set_members (
    key    TEXT NOT NULL,
    member TEXT NOT NULL,
    PRIMARY KEY (key, member)
);
CREATE TABLE IF NOT EXISTS blobs (
    blob_id  TEXT PRIMARY KEY,
    data     BLOB NOT NULL,
    metadata TEXT
);
";

/// SQLite-backed implementation of [`Storage`].
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.as_ref().display(), "Opened sqlite store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database. Test helper.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_kv(&self, table: &str, key: &str, value: &Value) -> StoreResult<()> {
        let text = serde_json::to_string(value)?;
        let sql = format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?1, ?2)");
        self.lock().execute(&sql, params![key, text])?;
        Ok(())
    }

    fn read_kv(&self, table: &str, key: &str) -> StoreResult<Option<Value>> {
        let sql = format!("SELECT value FROM {table} WHERE key = ?1");
        let conn = self.lock();
        let text: Option<String> = conn
            .query_row(&sql, params![key], |row| row.get(0))
            .optional()?;
        match text {
            Some(t) => Ok(Some(serde_json::from_str(&t)?)),
            None => Ok(None),
        }
    }

    fn batch_write_kv(&self, table: &str, items: Vec<(String, Value)>) -> StoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let sql = format!("INSERT OR REPLACE INTO {table} (key, value) VALUES (?1, ?2)");
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&sql)?;
            for (key, value) in items {
                stmt.execute(params![key, serde_json::to_string(&value)?])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn batch_read_kv(&self, table: &str, keys: &[String]) -> StoreResult<HashMap<String, Value>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        // One query with an IN list; SQLite caps host parameters well above
        // the batch sizes the engine uses.
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!("SELECT key, value FROM {table} WHERE key IN ({placeholders})");
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(keys.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut result = HashMap::new();
        for row in rows {
            let (key, text) = row?;
            result.insert(key, serde_json::from_str(&text)?);
        }
        Ok(result)
    }

    fn delete_kv(&self, table: &str, key: &str) -> StoreResult<()> {
        let sql = format!("DELETE FROM {table} WHERE key = ?1");
        self.lock().execute(&sql, params![key])?;
        Ok(())
    }

    fn scan_kv(&self, table: &str, pattern: &str) -> StoreResult<Vec<String>> {
        // SQLite GLOB shares the glob syntax the protocol specifies.
        let sql = format!("SELECT key FROM {table} WHERE key GLOB ?1");
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

impl Storage for SqliteStorage {
    fn write_persistent(&self, key: &str, value: Value) -> StoreResult<()> {
        self.write_kv("persistent", key, &value)
    }

    fn read_persistent(&self, key: &str) -> StoreResult<Option<Value>> {
        self.read_kv("persistent", key)
    }

    fn batch_write_persistent(&self, items: Vec<(String, Value)>) -> StoreResult<()> {
        self.batch_write_kv("persistent", items)
    }

    fn batch_read_persistent(&self, keys: &[String]) -> StoreResult<HashMap<String, Value>> {
        self.batch_read_kv("persistent", keys)
    }

    fn delete_persistent(&self, key: &str) -> StoreResult<()> {
        self.delete_kv("persistent", key)
    }

    fn scan_keys_persistent(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.scan_kv("persistent", pattern)
    }

    fn write_volatile(&self, key: &str, value: Value) -> StoreResult<()> {
        self.write_kv("volatile", key, &value)
    }

    fn read_volatile(&self, key: &str) -> StoreResult<Option<Value>> {
        self.read_kv("volatile", key)
    }

    fn delete_volatile(&self, key: &str) -> StoreResult<()> {
        self.delete_kv("volatile", key)
    }

    fn increment_volatile(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row("SELECT value FROM volatile WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        let current: i64 = match current {
            None => 0,
            Some(text) => serde_json::from_str::<Value>(&text)?
                .as_i64()
                .ok_or_else(|| StoreError::NotNumeric(key.to_string()))?,
        };
        let new_value = current + delta;
        tx.execute(
            "INSERT OR REPLACE INTO volatile (key, value) VALUES (?1, ?2)",
            params![key, new_value.to_string()],
        )?;
        tx.commit()?;
        Ok(new_value)
    }

    fn batch_read_volatile(&self, keys: &[String]) -> StoreResult<HashMap<String, Value>> {
        self.batch_read_kv("volatile", keys)
    }

    fn batch_write_volatile(&self, items: Vec<(String, Value)>) -> StoreResult<()> {
        self.batch_write_kv("volatile", items)
    }

    fn scan_keys_volatile(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.scan_kv("volatile", pattern)
    }

    fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        let changed = self.lock().execute(
            "INSERT OR IGNORE INTO set_members (key, member) VALUES (?1, ?2)",
            params![key, member],
        )?;
        Ok(changed > 0)
    }

    fn add_multiple_to_set(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt =
                tx.prepare("INSERT OR IGNORE INTO set_members (key, member) VALUES (?1, ?2)")?;
            for member in members {
                added += stmt.execute(params![key, member])?;
            }
        }
        tx.commit()?;
        Ok(added)
    }

    fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        let changed = self.lock().execute(
            "DELETE FROM set_members WHERE key = ?1 AND member = ?2",
            params![key, member],
        )?;
        Ok(changed > 0)
    }

    fn pop_from_set(&self, key: &str) -> StoreResult<Option<String>> {
        let popped = self.pop_multiple_from_set(key, 1)?;
        Ok(popped.into_iter().next())
    }

    fn pop_multiple_from_set(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let members: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT member FROM set_members WHERE key = ?1 LIMIT ?2")?;
            let rows = stmt.query_map(params![key, count as i64], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };
        {
            let mut stmt = tx.prepare("DELETE FROM set_members WHERE key = ?1 AND member = ?2")?;
            for member in &members {
                stmt.execute(params![key, member])?;
            }
        }
        tx.commit()?;
        Ok(members)
    }

    fn set_members(&self, key: &str) -> StoreResult<HashSet<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT member FROM set_members WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        let mut members = HashSet::new();
        for row in rows {
            members.insert(row?);
        }
        Ok(members)
    }

    fn set_size(&self, key: &str) -> StoreResult<usize> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM set_members WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn check_membership(&self, key: &str, members: &[String]) -> StoreResult<Vec<bool>> {
        let present = self.set_members(key)?;
        Ok(members.iter().map(|m| present.contains(m)).collect())
    }

    fn write_blob(&self, blob_id: &str, data: &[u8], metadata: Option<Value>) -> StoreResult<()> {
        let meta_text = match metadata {
            Some(m) => Some(serde_json::to_string(&m)?),
            None => None,
        };
        self.lock().execute(
            "INSERT OR REPLACE INTO blobs (blob_id, data, metadata) VALUES (?1, ?2, ?3)",
            params![blob_id, data, meta_text],
        )?;
        Ok(())
    }

    fn read_blob(&self, blob_id: &str) -> StoreResult<Option<Vec<u8>>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT data FROM blobs WHERE blob_id = ?1",
                params![blob_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn read_blob_metadata(&self, blob_id: &str) -> StoreResult<Option<Value>> {
        let conn = self.lock();
        let text: Option<Option<String>> = conn
            .query_row(
                "SELECT metadata FROM blobs WHERE blob_id = ?1",
                params![blob_id],
                |row| row.get(0),
            )
            .optional()?;
        match text.flatten() {
            Some(t) => Ok(Some(serde_json::from_str(&t)?)),
            None => Ok(None),
        }
    }

    fn delete_blob(&self, blob_id: &str) -> StoreResult<()> {
        self.lock()
            .execute("DELETE FROM blobs WHERE blob_id = ?1", params![blob_id])?;
        Ok(())
    }

    fn blob_exists(&self, blob_id: &str) -> StoreResult<bool> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM blobs WHERE blob_id = ?1",
            params![blob_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, SqliteStorage) {
        let dir = TempDir::new().unwrap();
        let storage = SqliteStorage::open(dir.path().join("store.db")).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_persistent_roundtrip() {
        let (_dir, storage) = open_temp();
        storage
            .write_persistent("job:1:meta", json!({"n": 3}))
            .unwrap();
        assert_eq!(
            storage.read_persistent("job:1:meta").unwrap(),
            Some(json!({"n": 3}))
        );
        storage.delete_persistent("job:1:meta").unwrap();
        assert_eq!(storage.read_persistent("job:1:meta").unwrap(), None);
    }

    #[test]
    fn test_batch_operations() {
        let (_dir, storage) = open_temp();
        let items: Vec<(String, Value)> = (0..10).map(|i| (format!("k{i}"), json!(i))).collect();
        storage.batch_write_persistent(items).unwrap();

        let keys: Vec<String> = (0..12).map(|i| format!("k{i}")).collect();
        let values = storage.batch_read_persistent(&keys).unwrap();
        assert_eq!(values.len(), 10);
        assert_eq!(values["k7"], json!(7));
    }

    #[test]
    fn test_increment_volatile() {
        let (_dir, storage) = open_temp();
        assert_eq!(storage.increment_volatile("c", 1).unwrap(), 1);
        assert_eq!(storage.increment_volatile("c", -3).unwrap(), -2);
        assert_eq!(storage.read_volatile("c").unwrap(), Some(json!(-2)));
    }

    #[test]
    fn test_sets() {
        let (_dir, storage) = open_temp();
        let members: Vec<String> = (0..4).map(|i| format!("m{i}")).collect();
        assert_eq!(storage.add_multiple_to_set("s", &members).unwrap(), 4);
        assert_eq!(storage.add_multiple_to_set("s", &members).unwrap(), 0);

        assert_eq!(storage.set_size("s").unwrap(), 4);
        let popped = storage.pop_multiple_from_set("s", 2).unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(storage.set_size("s").unwrap(), 2);

        let checks = storage.check_membership("s", &members).unwrap();
        assert_eq!(checks.iter().filter(|b| **b).count(), 2);
    }

    #[test]
    fn test_scan_glob() {
        let (_dir, storage) = open_temp();
        storage.write_volatile("task:a:status", json!("ready")).unwrap();
        storage.write_volatile("task:b:status", json!("ready")).unwrap();
        storage.write_volatile("interview:a:state", json!("running")).unwrap();

        let keys = storage.scan_keys_volatile("task:*:status").unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_blobs() {
        let (_dir, storage) = open_temp();
        storage
            .write_blob("b1", &[0xde, 0xad], Some(json!({"suffix": "png"})))
            .unwrap();
        assert!(storage.blob_exists("b1").unwrap());
        assert_eq!(storage.read_blob("b1").unwrap(), Some(vec![0xde, 0xad]));
        assert_eq!(
            storage.read_blob_metadata("b1").unwrap(),
            Some(json!({"suffix": "png"}))
        );
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.write_persistent("k", json!("v")).unwrap();
        }
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.read_persistent("k").unwrap(), Some(json!("v")));
    }
}
