//! The storage protocol
//!
//! Backends must guarantee per-key linearizability of writes, atomicity of
//! `increment_volatile`, `add_to_set`, and the pop operations, and execute
//! batch reads/writes as a single round trip where the backend allows.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

/// Stored values are JSON: scalars for counters and statuses, objects for
/// definitions and answers.
pub type Value = serde_json::Value;

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Cannot increment non-numeric value at key {0}")]
    NotNumeric(String),

    #[error("Invalid key pattern: {0}")]
    BadPattern(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Result alias for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Abstract interface over the four storage surfaces.
///
/// Implementations are shared across worker tasks behind an `Arc`, so every
/// method takes `&self` and the backend handles its own synchronization.
pub trait Storage: Send + Sync {
    // Persistent operations (immutable data: definitions, answers)

    /// Write immutable data to persistent storage.
    fn write_persistent(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Read from persistent storage. `None` if the key doesn't exist.
    fn read_persistent(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Write multiple items to persistent storage in one round trip.
    fn batch_write_persistent(&self, items: Vec<(String, Value)>) -> StoreResult<()>;

    /// Read multiple keys from persistent storage in one round trip.
    /// Missing keys are absent from the returned map.
    fn batch_read_persistent(&self, keys: &[String]) -> StoreResult<HashMap<String, Value>>;

    /// Delete a key from persistent storage.
    fn delete_persistent(&self, key: &str) -> StoreResult<()>;

    /// Scan persistent storage for keys matching a glob-style pattern.
    fn scan_keys_persistent(&self, pattern: &str) -> StoreResult<Vec<String>>;

    // Volatile operations (mutable data: counters, statuses)

    /// Write mutable data to volatile storage.
    fn write_volatile(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Read from volatile storage. `None` if the key doesn't exist.
    fn read_volatile(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Delete a key from volatile storage.
    fn delete_volatile(&self, key: &str) -> StoreResult<()>;

    /// Atomically add `delta` to a counter, creating it at 0 if missing.
    /// Returns the new value.
    fn increment_volatile(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Read multiple volatile keys in one round trip.
    fn batch_read_volatile(&self, keys: &[String]) -> StoreResult<HashMap<String, Value>>;

    /// Write multiple volatile keys in one round trip.
    fn batch_write_volatile(&self, items: Vec<(String, Value)>) -> StoreResult<()>;

    /// Scan volatile storage for keys matching a glob-style pattern.
    fn scan_keys_volatile(&self, pattern: &str) -> StoreResult<Vec<String>>;

    // Set operations

    /// Add a member to a set, creating the set if missing.
    /// Returns true if the member was newly added.
    fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Add multiple members in one round trip. Returns how many were new.
    fn add_multiple_to_set(&self, key: &str, members: &[String]) -> StoreResult<usize>;

    /// Remove a member. Returns true if it was present.
    fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Atomically remove and return an arbitrary member, or `None` if empty.
    fn pop_from_set(&self, key: &str) -> StoreResult<Option<String>>;

    /// Atomically remove and return up to `count` members.
    fn pop_multiple_from_set(&self, key: &str, count: usize) -> StoreResult<Vec<String>>;

    /// All members of a set (empty set if the key doesn't exist).
    fn set_members(&self, key: &str) -> StoreResult<HashSet<String>>;

    /// Number of members in a set.
    fn set_size(&self, key: &str) -> StoreResult<usize>;

    /// Membership check for multiple candidates, in order.
    fn check_membership(&self, key: &str, members: &[String]) -> StoreResult<Vec<bool>>;

    // Blob operations (large binary payloads, metadata-separable)

    /// Write binary blob data with optional metadata.
    fn write_blob(&self, blob_id: &str, data: &[u8], metadata: Option<Value>) -> StoreResult<()>;

    /// Read blob data. `None` if the blob doesn't exist.
    fn read_blob(&self, blob_id: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Read blob metadata without touching the payload.
    fn read_blob_metadata(&self, blob_id: &str) -> StoreResult<Option<Value>>;

    /// Delete a blob.
    fn delete_blob(&self, blob_id: &str) -> StoreResult<()>;

    /// Check whether a blob exists.
    fn blob_exists(&self, blob_id: &str) -> StoreResult<bool>;
}

/// Compile a glob-style key pattern, mapping failures to [`StoreError`].
pub(crate) fn compile_pattern(pattern: &str) -> StoreResult<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|_| StoreError::BadPattern(pattern.to_string()))
}
