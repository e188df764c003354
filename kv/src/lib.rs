//! KvStore - namespaced key-value storage for job execution state
//!
//! Exposes a single [`Storage`] trait with four surfaces:
//!
//! - **Persistent**: immutable definitions and answers (durable)
//! - **Volatile**: counters, statuses, and other hot mutable state
//! - **Sets**: ready-task sets, active-worker sets, counted-interview sets
//! - **Blobs**: large binary payloads offloaded from scenario fields
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStorage`] - thread-safe in-process maps, for tests and
//!   single-process runs
//! - [`SqliteStorage`] - rusqlite-backed, for single-node persistence and
//!   as the shared store in distributed mode
//!
//! Batch operations are part of the contract, not a convenience: callers on
//! hot paths are expected to use them so a logical step costs O(1) round
//! trips regardless of how many keys it touches.

pub mod cli;
pub mod memory;
pub mod protocol;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use protocol::{Storage, StoreError, StoreResult, Value};
pub use sqlite::SqliteStorage;
