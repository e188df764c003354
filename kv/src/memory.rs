//! In-memory storage backend
//!
//! A single mutex over plain maps. Suitable for unit tests and
//! single-process runs; state does not survive a restart and cannot be
//! shared across processes.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::protocol::{Storage, StoreError, StoreResult, Value, compile_pattern};

#[derive(Default)]
struct Inner {
    persistent: HashMap<String, Value>,
    volatile: HashMap<String, Value>,
    sets: HashMap<String, HashSet<String>>,
    blobs: HashMap<String, Vec<u8>>,
    blob_metadata: HashMap<String, Value>,
}

/// Thread-safe in-memory implementation of [`Storage`].
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock means a panic while holding it; propagate the
        // inner state anyway since maps stay structurally valid.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop all data. Test helper.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.persistent.clear();
        inner.volatile.clear();
        inner.sets.clear();
        inner.blobs.clear();
        inner.blob_metadata.clear();
    }

    /// Counts per surface, for diagnostics.
    pub fn stats(&self) -> MemoryStats {
        let inner = self.lock();
        MemoryStats {
            persistent_keys: inner.persistent.len(),
            volatile_keys: inner.volatile.len(),
            sets: inner.sets.len(),
            total_set_members: inner.sets.values().map(|s| s.len()).sum(),
            blobs: inner.blobs.len(),
            total_blob_bytes: inner.blobs.values().map(|b| b.len()).sum(),
        }
    }
}

/// Snapshot of storage occupancy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryStats {
    pub persistent_keys: usize,
    pub volatile_keys: usize,
    pub sets: usize,
    pub total_set_members: usize,
    pub blobs: usize,
    pub total_blob_bytes: usize,
}

impl Storage for MemoryStorage {
    fn write_persistent(&self, key: &str, value: Value) -> StoreResult<()> {
        self.lock().persistent.insert(key.to_string(), value);
        Ok(())
    }

    fn read_persistent(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.lock().persistent.get(key).cloned())
    }

    fn batch_write_persistent(&self, items: Vec<(String, Value)>) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.persistent.extend(items);
        Ok(())
    }

    fn batch_read_persistent(&self, keys: &[String]) -> StoreResult<HashMap<String, Value>> {
        let inner = self.lock();
        Ok(keys
            .iter()
            .filter_map(|k| inner.persistent.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn delete_persistent(&self, key: &str) -> StoreResult<()> {
        self.lock().persistent.remove(key);
        Ok(())
    }

    fn scan_keys_persistent(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let inner = self.lock();
        Ok(inner
            .persistent
            .keys()
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect())
    }

    fn write_volatile(&self, key: &str, value: Value) -> StoreResult<()> {
        self.lock().volatile.insert(key.to_string(), value);
        Ok(())
    }

    fn read_volatile(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.lock().volatile.get(key).cloned())
    }

    fn delete_volatile(&self, key: &str) -> StoreResult<()> {
        self.lock().volatile.remove(key);
        Ok(())
    }

    fn increment_volatile(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut inner = self.lock();
        let current = match inner.volatile.get(key) {
            None => 0,
            Some(v) => v
                .as_i64()
                .ok_or_else(|| StoreError::NotNumeric(key.to_string()))?,
        };
        let new_value = current + delta;
        inner.volatile.insert(key.to_string(), Value::from(new_value));
        Ok(new_value)
    }

    fn batch_read_volatile(&self, keys: &[String]) -> StoreResult<HashMap<String, Value>> {
        let inner = self.lock();
        Ok(keys
            .iter()
            .filter_map(|k| inner.volatile.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    fn batch_write_volatile(&self, items: Vec<(String, Value)>) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.volatile.extend(items);
        Ok(())
    }

    fn scan_keys_volatile(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let matcher = compile_pattern(pattern)?;
        let inner = self.lock();
        Ok(inner
            .volatile
            .keys()
            .filter(|k| matcher.matches(k))
            .cloned()
            .collect())
    }

    fn add_to_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    fn add_multiple_to_set(&self, key: &str, members: &[String]) -> StoreResult<usize> {
        let mut inner = self.lock();
        let set = inner.sets.entry(key.to_string()).or_default();
        let mut added = 0;
        for member in members {
            if set.insert(member.clone()) {
                added += 1;
            }
        }
        Ok(added)
    }

    fn remove_from_set(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        Ok(inner
            .sets
            .get_mut(key)
            .map(|s| s.remove(member))
            .unwrap_or(false))
    }

    fn pop_from_set(&self, key: &str) -> StoreResult<Option<String>> {
        let mut inner = self.lock();
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(None);
        };
        let member = set.iter().next().cloned();
        if let Some(ref m) = member {
            set.remove(m);
        }
        Ok(member)
    }

    fn pop_multiple_from_set(&self, key: &str, count: usize) -> StoreResult<Vec<String>> {
        let mut inner = self.lock();
        let Some(set) = inner.sets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let members: Vec<String> = set.iter().take(count).cloned().collect();
        for m in &members {
            set.remove(m);
        }
        Ok(members)
    }

    fn set_members(&self, key: &str) -> StoreResult<HashSet<String>> {
        Ok(self.lock().sets.get(key).cloned().unwrap_or_default())
    }

    fn set_size(&self, key: &str) -> StoreResult<usize> {
        Ok(self.lock().sets.get(key).map(|s| s.len()).unwrap_or(0))
    }

    fn check_membership(&self, key: &str, members: &[String]) -> StoreResult<Vec<bool>> {
        let inner = self.lock();
        let set = inner.sets.get(key);
        Ok(members
            .iter()
            .map(|m| set.map(|s| s.contains(m)).unwrap_or(false))
            .collect())
    }

    fn write_blob(&self, blob_id: &str, data: &[u8], metadata: Option<Value>) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.blobs.insert(blob_id.to_string(), data.to_vec());
        inner
            .blob_metadata
            .insert(blob_id.to_string(), metadata.unwrap_or(Value::Null));
        Ok(())
    }

    fn read_blob(&self, blob_id: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.lock().blobs.get(blob_id).cloned())
    }

    fn read_blob_metadata(&self, blob_id: &str) -> StoreResult<Option<Value>> {
        Ok(self.lock().blob_metadata.get(blob_id).cloned())
    }

    fn delete_blob(&self, blob_id: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.blobs.remove(blob_id);
        inner.blob_metadata.remove(blob_id);
        Ok(())
    }

    fn blob_exists(&self, blob_id: &str) -> StoreResult<bool> {
        Ok(self.lock().blobs.contains_key(blob_id))
    }
}
