//! Interview store: definitions and per-interview task counters

use std::collections::HashMap;
use std::sync::Arc;

use kvstore::{Storage, StoreResult, Value};

use crate::domain::{InterviewDefinition, InterviewState, InterviewStatus};

/// Reads and writes interview-scoped data.
pub struct InterviewStore {
    storage: Arc<dyn Storage>,
}

impl InterviewStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    // Write operations

    /// Create many interviews in two batch writes.
    pub fn create_batch(&self, definitions: &[InterviewDefinition]) -> StoreResult<()> {
        if definitions.is_empty() {
            return Ok(());
        }

        let mut persistent_items = Vec::with_capacity(definitions.len());
        let mut volatile_items = Vec::with_capacity(definitions.len() * 5);

        for defn in definitions {
            persistent_items.push((defn.storage_key(), serde_json::to_value(defn)?));

            let id = &defn.interview_id;
            volatile_items.push((format!("interview:{id}:completed"), Value::from(0)));
            volatile_items.push((format!("interview:{id}:skipped"), Value::from(0)));
            volatile_items.push((format!("interview:{id}:failed"), Value::from(0)));
            volatile_items.push((format!("interview:{id}:blocked"), Value::from(0)));
            volatile_items.push((
                format!("interview:{id}:state"),
                serde_json::to_value(InterviewState::Running)?,
            ));
        }

        self.storage.batch_write_persistent(persistent_items)?;
        self.storage.batch_write_volatile(volatile_items)?;
        Ok(())
    }

    pub fn increment_completed(&self, interview_id: &str) -> StoreResult<i64> {
        self.storage
            .increment_volatile(&format!("interview:{interview_id}:completed"), 1)
    }

    pub fn increment_skipped(&self, interview_id: &str) -> StoreResult<i64> {
        self.storage
            .increment_volatile(&format!("interview:{interview_id}:skipped"), 1)
    }

    pub fn increment_failed(&self, interview_id: &str) -> StoreResult<i64> {
        self.storage
            .increment_volatile(&format!("interview:{interview_id}:failed"), 1)
    }

    pub fn increment_blocked(&self, interview_id: &str) -> StoreResult<i64> {
        self.storage
            .increment_volatile(&format!("interview:{interview_id}:blocked"), 1)
    }

    pub fn set_state(&self, interview_id: &str, state: InterviewState) -> StoreResult<()> {
        self.storage.write_volatile(
            &format!("interview:{interview_id}:state"),
            serde_json::to_value(state)?,
        )
    }

    // Read operations

    pub fn get_definition(
        &self,
        job_id: &str,
        interview_id: &str,
    ) -> StoreResult<Option<InterviewDefinition>> {
        let key = format!("job:{job_id}:interview:{interview_id}");
        match self.storage.read_persistent(&key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn get_definitions_batch(
        &self,
        job_id: &str,
        interview_ids: &[String],
    ) -> StoreResult<HashMap<String, InterviewDefinition>> {
        if interview_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = interview_ids
            .iter()
            .map(|iid| format!("job:{job_id}:interview:{iid}"))
            .collect();
        let values = self.storage.batch_read_persistent(&keys)?;

        let mut result = HashMap::new();
        for (iid, key) in interview_ids.iter().zip(keys.iter()) {
            if let Some(value) = values.get(key) {
                result.insert(iid.clone(), serde_json::from_value(value.clone())?);
            }
        }
        Ok(result)
    }

    pub fn get_status(&self, interview_id: &str) -> StoreResult<InterviewStatus> {
        let statuses = self.get_statuses_batch(std::slice::from_ref(&interview_id.to_string()))?;
        Ok(statuses
            .into_values()
            .next()
            .unwrap_or_else(|| InterviewStatus {
                interview_id: interview_id.to_string(),
                ..Default::default()
            }))
    }

    pub fn get_statuses_batch(
        &self,
        interview_ids: &[String],
    ) -> StoreResult<HashMap<String, InterviewStatus>> {
        if interview_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut keys = Vec::with_capacity(interview_ids.len() * 4);
        for iid in interview_ids {
            keys.push(format!("interview:{iid}:completed"));
            keys.push(format!("interview:{iid}:skipped"));
            keys.push(format!("interview:{iid}:failed"));
            keys.push(format!("interview:{iid}:blocked"));
        }
        let values = self.storage.batch_read_volatile(&keys)?;
        let read = |key: &str| values.get(key).and_then(Value::as_i64).unwrap_or(0);

        Ok(interview_ids
            .iter()
            .map(|iid| {
                (
                    iid.clone(),
                    InterviewStatus {
                        interview_id: iid.clone(),
                        completed: read(&format!("interview:{iid}:completed")),
                        skipped: read(&format!("interview:{iid}:skipped")),
                        failed: read(&format!("interview:{iid}:failed")),
                        blocked: read(&format!("interview:{iid}:blocked")),
                    },
                )
            })
            .collect())
    }

    pub fn get_state(&self, interview_id: &str) -> StoreResult<InterviewState> {
        let value = self
            .storage
            .read_volatile(&format!("interview:{interview_id}:state"))?;
        match value {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(InterviewState::Running),
        }
    }

    pub fn get_states_batch(
        &self,
        interview_ids: &[String],
    ) -> StoreResult<HashMap<String, InterviewState>> {
        if interview_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = interview_ids
            .iter()
            .map(|iid| format!("interview:{iid}:state"))
            .collect();
        let values = self.storage.batch_read_volatile(&keys)?;

        let mut result = HashMap::new();
        for (iid, key) in interview_ids.iter().zip(keys.iter()) {
            let state = match values.get(key) {
                Some(v) => serde_json::from_value(v.clone())?,
                None => InterviewState::Running,
            };
            result.insert(iid.clone(), state);
        }
        Ok(result)
    }

    // Composite operations

    pub fn mark_task_completed(&self, job_id: &str, interview_id: &str) -> StoreResult<()> {
        self.increment_completed(interview_id)?;
        self.maybe_finalize(job_id, interview_id)
    }

    pub fn mark_task_skipped(&self, job_id: &str, interview_id: &str) -> StoreResult<()> {
        self.increment_skipped(interview_id)?;
        self.maybe_finalize(job_id, interview_id)
    }

    pub fn mark_task_failed(&self, job_id: &str, interview_id: &str) -> StoreResult<()> {
        self.increment_failed(interview_id)?;
        self.maybe_finalize(job_id, interview_id)
    }

    pub fn mark_task_blocked(&self, job_id: &str, interview_id: &str) -> StoreResult<()> {
        self.increment_blocked(interview_id)?;
        self.maybe_finalize(job_id, interview_id)
    }

    /// Update interview state if every task has reached a terminal status.
    fn maybe_finalize(&self, job_id: &str, interview_id: &str) -> StoreResult<()> {
        let Some(definition) = self.get_definition(job_id, interview_id)? else {
            return Ok(());
        };
        let status = self.get_status(interview_id)?;
        if status.is_done(definition.total_tasks) {
            self.set_state(interview_id, status.compute_state(definition.total_tasks))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvstore::MemoryStorage;

    fn interview_def(job_id: &str, interview_id: &str, total_tasks: usize) -> InterviewDefinition {
        InterviewDefinition {
            interview_id: interview_id.to_string(),
            job_id: job_id.to_string(),
            scenario_id: "s".to_string(),
            agent_id: "a".to_string(),
            model_id: "m".to_string(),
            iteration: 0,
            total_tasks,
            task_ids: (0..total_tasks).map(|i| format!("t{i}")).collect(),
            question_option_permutations: HashMap::new(),
        }
    }

    fn store() -> InterviewStore {
        InterviewStore::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_create_batch_initializes_counters() {
        let interviews = store();
        interviews
            .create_batch(&[interview_def("j", "i1", 3), interview_def("j", "i2", 3)])
            .unwrap();

        assert_eq!(interviews.get_state("i1").unwrap(), InterviewState::Running);
        let status = interviews.get_status("i1").unwrap();
        assert_eq!(status.terminal_count(), 0);
    }

    #[test]
    fn test_finalize_on_last_task() {
        let interviews = store();
        interviews.create_batch(&[interview_def("j", "i1", 2)]).unwrap();

        interviews.mark_task_completed("j", "i1").unwrap();
        assert_eq!(interviews.get_state("i1").unwrap(), InterviewState::Running);

        interviews.mark_task_skipped("j", "i1").unwrap();
        assert_eq!(interviews.get_state("i1").unwrap(), InterviewState::Completed);
    }

    #[test]
    fn test_finalize_with_failures() {
        let interviews = store();
        interviews.create_batch(&[interview_def("j", "i1", 2)]).unwrap();

        interviews.mark_task_failed("j", "i1").unwrap();
        interviews.mark_task_blocked("j", "i1").unwrap();

        assert_eq!(
            interviews.get_state("i1").unwrap(),
            InterviewState::CompletedWithFailures
        );
        let status = interviews.get_status("i1").unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.blocked, 1);
    }

    #[test]
    fn test_states_batch_defaults_running() {
        let interviews = store();
        let states = interviews
            .get_states_batch(&["missing".to_string()])
            .unwrap();
        assert_eq!(states["missing"], InterviewState::Running);
    }
}
