//! Worker registry: registration, heartbeats, dead-worker detection
//!
//! Lives on the shared storage so any process can observe worker
//! liveness. A worker is dead iff its last heartbeat is older than the
//! heartbeat timeout.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kvstore::{Storage, StoreResult, Value};
use serde::{Deserialize, Serialize};

use crate::domain::generate_id;

const WORKERS_SET_KEY: &str = "workers:active";

fn worker_key(worker_id: &str) -> String {
    format!("worker:{worker_id}:info")
}

/// A registered worker's record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub current_job_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

impl WorkerInfo {
    /// Alive iff a heartbeat arrived within the timeout.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        let elapsed = Utc::now().signed_duration_since(self.last_heartbeat);
        elapsed.num_milliseconds() < timeout.as_millis() as i64
    }
}

/// Registry statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegistryStats {
    pub total_registered: usize,
    pub alive: usize,
    pub dead: usize,
    pub working: usize,
    pub idle: usize,
}

/// Tracks distributed workers through shared storage.
pub struct WorkerRegistry {
    storage: Arc<dyn Storage>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(storage: Arc<dyn Storage>, heartbeat_timeout: Duration) -> Self {
        Self {
            storage,
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// Register a worker, generating an id when none is supplied.
    pub fn register(
        &self,
        worker_id: Option<String>,
        capabilities: Value,
        metadata: Value,
    ) -> StoreResult<WorkerInfo> {
        let worker_id = worker_id.unwrap_or_else(generate_id);
        let now = Utc::now();
        let info = WorkerInfo {
            worker_id: worker_id.clone(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            started_at: now,
            last_heartbeat: now,
            capabilities,
            current_task_id: None,
            current_job_id: None,
            metadata,
        };

        self.storage
            .write_persistent(&worker_key(&worker_id), serde_json::to_value(&info)?)?;
        self.storage.add_to_set(WORKERS_SET_KEY, &worker_id)?;
        Ok(info)
    }

    /// Record a heartbeat with the worker's current task linkage.
    /// Returns false if the worker is not registered.
    pub fn heartbeat(
        &self,
        worker_id: &str,
        current_task_id: Option<&str>,
        current_job_id: Option<&str>,
    ) -> StoreResult<bool> {
        let key = worker_key(worker_id);
        let Some(data) = self.storage.read_persistent(&key)? else {
            return Ok(false);
        };
        let mut info: WorkerInfo = serde_json::from_value(data)?;
        info.last_heartbeat = Utc::now();
        info.current_task_id = current_task_id.map(String::from);
        info.current_job_id = current_job_id.map(String::from);
        self.storage
            .write_persistent(&key, serde_json::to_value(&info)?)?;
        Ok(true)
    }

    /// Remove a worker. Returns false if it wasn't registered.
    pub fn unregister(&self, worker_id: &str) -> StoreResult<bool> {
        let key = worker_key(worker_id);
        if self.storage.read_persistent(&key)?.is_none() {
            return Ok(false);
        }
        self.storage.remove_from_set(WORKERS_SET_KEY, worker_id)?;
        self.storage.delete_persistent(&key)?;
        Ok(true)
    }

    pub fn get_worker(&self, worker_id: &str) -> StoreResult<Option<WorkerInfo>> {
        match self.storage.read_persistent(&worker_key(worker_id))? {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    /// All registered workers, one batch read.
    pub fn get_active_workers(&self) -> StoreResult<Vec<WorkerInfo>> {
        let worker_ids = self.storage.set_members(WORKERS_SET_KEY)?;
        let keys: Vec<String> = worker_ids.iter().map(|id| worker_key(id)).collect();
        let values = self.storage.batch_read_persistent(&keys)?;

        let mut workers = Vec::with_capacity(values.len());
        for value in values.into_values() {
            workers.push(serde_json::from_value(value)?);
        }
        Ok(workers)
    }

    pub fn get_alive_workers(&self) -> StoreResult<Vec<WorkerInfo>> {
        Ok(self
            .get_active_workers()?
            .into_iter()
            .filter(|w| w.is_alive(self.heartbeat_timeout))
            .collect())
    }

    /// Workers whose heartbeats lapsed. `timeout` overrides the
    /// registry's configured timeout.
    pub fn get_dead_workers(&self, timeout: Option<Duration>) -> StoreResult<Vec<WorkerInfo>> {
        let timeout = timeout.unwrap_or(self.heartbeat_timeout);
        Ok(self
            .get_active_workers()?
            .into_iter()
            .filter(|w| !w.is_alive(timeout))
            .collect())
    }

    /// (worker_id, job_id, task_id) for every task held by a dead worker.
    pub fn get_dead_worker_tasks(&self) -> StoreResult<Vec<(String, String, String)>> {
        Ok(self
            .get_dead_workers(None)?
            .into_iter()
            .filter_map(|w| {
                w.current_task_id.map(|task_id| {
                    (
                        w.worker_id,
                        w.current_job_id.unwrap_or_default(),
                        task_id,
                    )
                })
            })
            .collect())
    }

    /// Drop dead workers from the registry; returns the removed records.
    pub fn cleanup_dead_workers(&self) -> StoreResult<Vec<WorkerInfo>> {
        let dead = self.get_dead_workers(None)?;
        for worker in &dead {
            self.storage
                .remove_from_set(WORKERS_SET_KEY, &worker.worker_id)?;
            self.storage.delete_persistent(&worker_key(&worker.worker_id))?;
        }
        Ok(dead)
    }

    /// (worker_id, job_id, task_id) across all live assignments.
    pub fn get_in_flight_tasks(&self) -> StoreResult<Vec<(String, String, String)>> {
        Ok(self
            .get_active_workers()?
            .into_iter()
            .filter_map(|w| {
                w.current_task_id.map(|task_id| {
                    (
                        w.worker_id,
                        w.current_job_id.unwrap_or_default(),
                        task_id,
                    )
                })
            })
            .collect())
    }

    pub fn stats(&self) -> StoreResult<WorkerRegistryStats> {
        let workers = self.get_active_workers()?;
        let alive: Vec<&WorkerInfo> = workers
            .iter()
            .filter(|w| w.is_alive(self.heartbeat_timeout))
            .collect();
        let working = alive.iter().filter(|w| w.current_task_id.is_some()).count();

        Ok(WorkerRegistryStats {
            total_registered: workers.len(),
            alive: alive.len(),
            dead: workers.len() - alive.len(),
            working,
            idle: alive.len() - working,
        })
    }
}
