//! Task store: definitions, hot state, the ready set, dependency counters

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kvstore::{Storage, StoreResult, Value};
use serde_json::json;

use crate::domain::{TaskDefinition, TaskState, TaskStatus};

/// Reads and writes task-scoped data.
pub struct TaskStore {
    storage: Arc<dyn Storage>,
}

impl TaskStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    // Write operations

    /// Create many tasks in three batch writes plus one ready-set add per
    /// job. Regardless of task count this costs O(1) storage round trips.
    pub fn create_batch(&self, definitions: &[TaskDefinition]) -> StoreResult<()> {
        if definitions.is_empty() {
            return Ok(());
        }

        let mut persistent_items = Vec::with_capacity(definitions.len());
        let mut volatile_items = Vec::with_capacity(definitions.len() * 4);
        let mut ready_by_job: HashMap<String, Vec<String>> = HashMap::new();

        for defn in definitions {
            persistent_items.push((defn.storage_key(), serde_json::to_value(defn)?));

            let tid = &defn.task_id;
            // Location index for O(1) task -> (job, interview) lookup
            volatile_items.push((
                format!("task:{tid}:location"),
                json!({"job_id": defn.job_id, "interview_id": defn.interview_id}),
            ));
            volatile_items.push((
                format!("task:{tid}:status"),
                serde_json::to_value(defn.initial_status())?,
            ));
            volatile_items.push((
                format!("task:{tid}:unmet_deps"),
                Value::from(defn.depends_on.len() as i64),
            ));
            volatile_items.push((format!("task:{tid}:attempts"), json!({})));

            if defn.initial_status() == TaskStatus::Ready {
                ready_by_job
                    .entry(defn.job_id.clone())
                    .or_default()
                    .push(tid.clone());
            }
        }

        self.storage.batch_write_persistent(persistent_items)?;
        self.storage.batch_write_volatile(volatile_items)?;
        for (job_id, task_ids) in ready_by_job {
            self.storage
                .add_multiple_to_set(&format!("job:{job_id}:ready_tasks"), &task_ids)?;
        }
        Ok(())
    }

    pub fn set_status(&self, task_id: &str, status: TaskStatus) -> StoreResult<()> {
        self.storage
            .write_volatile(&format!("task:{task_id}:status"), serde_json::to_value(status)?)
    }

    pub fn set_statuses_batch(&self, task_ids: &[String], status: TaskStatus) -> StoreResult<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let value = serde_json::to_value(status)?;
        let items = task_ids
            .iter()
            .map(|tid| (format!("task:{tid}:status"), value.clone()))
            .collect();
        self.storage.batch_write_volatile(items)
    }

    /// Returns the new count after the atomic decrement.
    pub fn decrement_unmet_deps(&self, task_id: &str) -> StoreResult<i64> {
        self.storage
            .increment_volatile(&format!("task:{task_id}:unmet_deps"), -1)
    }

    /// Bump the attempt count for one error kind; returns the new count.
    pub fn increment_attempt(&self, task_id: &str, error_kind: &str) -> StoreResult<u32> {
        let key = format!("task:{task_id}:attempts");
        let mut attempts: HashMap<String, u32> = match self.storage.read_volatile(&key)? {
            Some(v) => serde_json::from_value(v)?,
            None => HashMap::new(),
        };
        let count = attempts.entry(error_kind.to_string()).or_insert(0);
        *count += 1;
        let new_count = *count;
        self.storage.write_volatile(&key, serde_json::to_value(attempts)?)?;
        Ok(new_count)
    }

    pub fn set_error(&self, task_id: &str, error_kind: &str, error_message: &str) -> StoreResult<()> {
        self.storage.write_volatile(
            &format!("task:{task_id}:last_error"),
            json!({"kind": error_kind, "message": error_message}),
        )
    }

    pub fn set_next_retry(&self, task_id: &str, retry_time: DateTime<Utc>) -> StoreResult<()> {
        self.storage.write_volatile(
            &format!("task:{task_id}:next_retry"),
            Value::from(retry_time.to_rfc3339()),
        )
    }

    // Read operations

    pub fn get_definition(
        &self,
        job_id: &str,
        interview_id: &str,
        task_id: &str,
    ) -> StoreResult<Option<TaskDefinition>> {
        let key = format!("job:{job_id}:interview:{interview_id}:task:{task_id}");
        match self.storage.read_persistent(&key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn get_definitions_batch(
        &self,
        job_id: &str,
        interview_id: &str,
        task_ids: &[String],
    ) -> StoreResult<HashMap<String, TaskDefinition>> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = task_ids
            .iter()
            .map(|tid| format!("job:{job_id}:interview:{interview_id}:task:{tid}"))
            .collect();
        let values = self.storage.batch_read_persistent(&keys)?;

        let mut result = HashMap::new();
        for (tid, key) in task_ids.iter().zip(keys.iter()) {
            if let Some(value) = values.get(key) {
                result.insert(tid.clone(), serde_json::from_value(value.clone())?);
            }
        }
        Ok(result)
    }

    pub fn get_status(&self, task_id: &str) -> StoreResult<TaskStatus> {
        let value = self.storage.read_volatile(&format!("task:{task_id}:status"))?;
        match value {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(TaskStatus::Pending),
        }
    }

    pub fn get_statuses_batch(
        &self,
        task_ids: &[String],
    ) -> StoreResult<HashMap<String, TaskStatus>> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = task_ids
            .iter()
            .map(|tid| format!("task:{tid}:status"))
            .collect();
        let values = self.storage.batch_read_volatile(&keys)?;

        let mut result = HashMap::new();
        for (tid, key) in task_ids.iter().zip(keys.iter()) {
            let status = match values.get(key) {
                Some(v) => serde_json::from_value(v.clone())?,
                None => TaskStatus::Pending,
            };
            result.insert(tid.clone(), status);
        }
        Ok(result)
    }

    pub fn get_state(&self, task_id: &str) -> StoreResult<TaskState> {
        let keys = vec![
            format!("task:{task_id}:status"),
            format!("task:{task_id}:unmet_deps"),
            format!("task:{task_id}:attempts"),
            format!("task:{task_id}:last_error"),
            format!("task:{task_id}:next_retry"),
        ];
        let values = self.storage.batch_read_volatile(&keys)?;

        let status = match values.get(&keys[0]) {
            Some(v) => serde_json::from_value(v.clone())?,
            None => TaskStatus::Pending,
        };
        let attempts = match values.get(&keys[2]) {
            Some(v) => serde_json::from_value(v.clone())?,
            None => HashMap::new(),
        };
        let last_error = values.get(&keys[3]);
        let next_retry = values
            .get(&keys[4])
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(TaskState {
            task_id: task_id.to_string(),
            status,
            unmet_deps: values.get(&keys[1]).and_then(Value::as_i64).unwrap_or(0),
            attempts,
            last_error_kind: last_error
                .and_then(|e| e.get("kind"))
                .and_then(Value::as_str)
                .map(String::from),
            last_error_message: last_error
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(String::from),
            next_retry,
        })
    }

    /// O(1) lookup of (job_id, interview_id) for a task.
    pub fn get_location(&self, task_id: &str) -> StoreResult<Option<(String, String)>> {
        let value = self
            .storage
            .read_volatile(&format!("task:{task_id}:location"))?;
        Ok(value.and_then(|v| {
            let job_id = v.get("job_id")?.as_str()?.to_string();
            let interview_id = v.get("interview_id")?.as_str()?.to_string();
            Some((job_id, interview_id))
        }))
    }

    pub fn get_locations_batch(
        &self,
        task_ids: &[String],
    ) -> StoreResult<HashMap<String, (String, String)>> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = task_ids
            .iter()
            .map(|tid| format!("task:{tid}:location"))
            .collect();
        let values = self.storage.batch_read_volatile(&keys)?;

        let mut result = HashMap::new();
        for (tid, key) in task_ids.iter().zip(keys.iter()) {
            if let Some(v) = values.get(key)
                && let (Some(job_id), Some(interview_id)) = (
                    v.get("job_id").and_then(Value::as_str),
                    v.get("interview_id").and_then(Value::as_str),
                )
            {
                result.insert(tid.clone(), (job_id.to_string(), interview_id.to_string()));
            }
        }
        Ok(result)
    }

    // Ready set operations

    pub fn pop_ready_task(&self, job_id: &str) -> StoreResult<Option<String>> {
        self.storage.pop_from_set(&format!("job:{job_id}:ready_tasks"))
    }

    pub fn pop_ready_tasks_batch(&self, job_id: &str, count: usize) -> StoreResult<Vec<String>> {
        self.storage
            .pop_multiple_from_set(&format!("job:{job_id}:ready_tasks"), count)
    }

    pub fn add_to_ready(&self, job_id: &str, task_id: &str) -> StoreResult<()> {
        self.storage
            .add_to_set(&format!("job:{job_id}:ready_tasks"), task_id)?;
        Ok(())
    }

    pub fn get_ready_count(&self, job_id: &str) -> StoreResult<usize> {
        self.storage.set_size(&format!("job:{job_id}:ready_tasks"))
    }

    // Composite operations

    /// Decrement `unmet_deps`; the caller that observes zero performs the
    /// PENDING -> READY transition. The atomic decrement is the
    /// serialization point, so the transition fires exactly once.
    pub fn mark_dependency_satisfied(&self, job_id: &str, task_id: &str) -> StoreResult<bool> {
        let new_count = self.decrement_unmet_deps(task_id)?;
        if new_count == 0 {
            self.set_status(task_id, TaskStatus::Ready)?;
            self.add_to_ready(job_id, task_id)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionType;
    use kvstore::MemoryStorage;

    fn task_def(task_id: &str, depends_on: Vec<String>, dependents: Vec<String>) -> TaskDefinition {
        TaskDefinition {
            task_id: task_id.to_string(),
            job_id: "j".to_string(),
            interview_id: "i".to_string(),
            scenario_id: "s".to_string(),
            agent_id: "a".to_string(),
            model_id: "m".to_string(),
            question_id: "q".to_string(),
            question_name: format!("name_{task_id}"),
            iteration: 0,
            depends_on,
            dependents,
            execution_type: ExecutionType::Llm,
        }
    }

    fn store() -> TaskStore {
        TaskStore::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_create_batch_roots_ready() {
        let tasks = store();
        tasks
            .create_batch(&[
                task_def("t1", vec![], vec!["t2".to_string()]),
                task_def("t2", vec!["t1".to_string()], vec![]),
            ])
            .unwrap();

        assert_eq!(tasks.get_status("t1").unwrap(), TaskStatus::Ready);
        assert_eq!(tasks.get_status("t2").unwrap(), TaskStatus::Pending);
        assert_eq!(tasks.get_ready_count("j").unwrap(), 1);

        let location = tasks.get_location("t1").unwrap();
        assert_eq!(location, Some(("j".to_string(), "i".to_string())));
    }

    #[test]
    fn test_mark_dependency_satisfied_exactly_once() {
        let tasks = store();
        tasks
            .create_batch(&[
                task_def("t1", vec![], vec!["t3".to_string()]),
                task_def("t2", vec![], vec!["t3".to_string()]),
                task_def("t3", vec!["t1".to_string(), "t2".to_string()], vec![]),
            ])
            .unwrap();

        assert!(!tasks.mark_dependency_satisfied("j", "t3").unwrap());
        assert_eq!(tasks.get_status("t3").unwrap(), TaskStatus::Pending);

        // Second satisfaction hits zero and transitions exactly once
        assert!(tasks.mark_dependency_satisfied("j", "t3").unwrap());
        assert_eq!(tasks.get_status("t3").unwrap(), TaskStatus::Ready);

        let state = tasks.get_state("t3").unwrap();
        assert_eq!(state.unmet_deps, 0);
    }

    #[test]
    fn test_attempts_accumulate_per_kind() {
        let tasks = store();
        tasks.create_batch(&[task_def("t1", vec![], vec![])]).unwrap();

        assert_eq!(tasks.increment_attempt("t1", "server_error").unwrap(), 1);
        assert_eq!(tasks.increment_attempt("t1", "server_error").unwrap(), 2);
        assert_eq!(tasks.increment_attempt("t1", "rate_limit").unwrap(), 1);

        let state = tasks.get_state("t1").unwrap();
        assert_eq!(state.attempts["server_error"], 2);
        assert_eq!(state.attempts["rate_limit"], 1);
    }

    #[test]
    fn test_error_recorded() {
        let tasks = store();
        tasks.create_batch(&[task_def("t1", vec![], vec![])]).unwrap();
        tasks.set_error("t1", "server_error", "500 from provider").unwrap();

        let state = tasks.get_state("t1").unwrap();
        assert_eq!(state.last_error_kind.as_deref(), Some("server_error"));
        assert_eq!(state.last_error_message.as_deref(), Some("500 from provider"));
    }

    #[test]
    fn test_pop_ready_batch() {
        let tasks = store();
        let defs: Vec<TaskDefinition> = (0..5)
            .map(|i| task_def(&format!("t{i}"), vec![], vec![]))
            .collect();
        tasks.create_batch(&defs).unwrap();

        let popped = tasks.pop_ready_tasks_batch("j", 3).unwrap();
        assert_eq!(popped.len(), 3);
        assert_eq!(tasks.get_ready_count("j").unwrap(), 2);
    }

    #[test]
    fn test_statuses_batch() {
        let tasks = store();
        tasks
            .create_batch(&[task_def("t1", vec![], vec![]), task_def("t2", vec![], vec![])])
            .unwrap();
        tasks.set_statuses_batch(&["t1".to_string()], TaskStatus::Queued).unwrap();

        let statuses = tasks
            .get_statuses_batch(&["t1".to_string(), "t2".to_string()])
            .unwrap();
        assert_eq!(statuses["t1"], TaskStatus::Queued);
        assert_eq!(statuses["t2"], TaskStatus::Ready);
    }
}
