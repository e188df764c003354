//! Job store: definitions, shared resources, interview counters

use std::collections::HashMap;
use std::sync::Arc;

use kvstore::{Storage, StoreResult, Value};
use tracing::debug;

use crate::domain::{JobDefinition, JobState, JobStatus};

/// Reads and writes job-scoped data.
pub struct JobStore {
    storage: Arc<dyn Storage>,
}

impl JobStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    // Write operations

    /// Write the definition (persistent) and initialize counters (volatile).
    pub fn create(&self, definition: &JobDefinition) -> StoreResult<()> {
        self.storage.write_persistent(
            &definition.storage_key(),
            serde_json::to_value(definition)?,
        )?;

        let job_id = &definition.job_id;
        self.storage.batch_write_volatile(vec![
            (
                format!("job:{job_id}:state"),
                serde_json::to_value(JobState::Running)?,
            ),
            (format!("job:{job_id}:completed_interviews"), Value::from(0)),
            (format!("job:{job_id}:failed_interviews"), Value::from(0)),
        ])?;
        Ok(())
    }

    pub fn write_survey(&self, job_id: &str, survey: Value) -> StoreResult<()> {
        self.storage
            .write_persistent(&format!("job:{job_id}:survey"), survey)
    }

    pub fn write_scenarios_batch(
        &self,
        job_id: &str,
        scenarios: Vec<(String, Value)>,
    ) -> StoreResult<()> {
        let items = scenarios
            .into_iter()
            .map(|(id, data)| (format!("job:{job_id}:scenario:{id}"), data))
            .collect();
        self.storage.batch_write_persistent(items)
    }

    pub fn write_agents_batch(&self, job_id: &str, agents: Vec<(String, Value)>) -> StoreResult<()> {
        let items = agents
            .into_iter()
            .map(|(id, data)| (format!("job:{job_id}:agent:{id}"), data))
            .collect();
        self.storage.batch_write_persistent(items)
    }

    pub fn write_models_batch(&self, job_id: &str, models: Vec<(String, Value)>) -> StoreResult<()> {
        let items = models
            .into_iter()
            .map(|(id, data)| (format!("job:{job_id}:model:{id}"), data))
            .collect();
        self.storage.batch_write_persistent(items)
    }

    pub fn write_questions_batch(
        &self,
        job_id: &str,
        questions: Vec<(String, Value)>,
    ) -> StoreResult<()> {
        let items = questions
            .into_iter()
            .map(|(id, data)| (format!("job:{job_id}:question:{id}"), data))
            .collect();
        self.storage.batch_write_persistent(items)
    }

    pub fn increment_completed_interviews(&self, job_id: &str) -> StoreResult<i64> {
        self.storage
            .increment_volatile(&format!("job:{job_id}:completed_interviews"), 1)
    }

    pub fn increment_failed_interviews(&self, job_id: &str) -> StoreResult<i64> {
        self.storage
            .increment_volatile(&format!("job:{job_id}:failed_interviews"), 1)
    }

    pub fn set_state(&self, job_id: &str, state: JobState) -> StoreResult<()> {
        self.storage
            .write_volatile(&format!("job:{job_id}:state"), serde_json::to_value(state)?)
    }

    // Read operations

    pub fn get_definition(&self, job_id: &str) -> StoreResult<Option<JobDefinition>> {
        let data = self.storage.read_persistent(&format!("job:{job_id}:meta"))?;
        match data {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn get_status(&self, job_id: &str) -> StoreResult<JobStatus> {
        let keys = vec![
            format!("job:{job_id}:completed_interviews"),
            format!("job:{job_id}:failed_interviews"),
        ];
        let values = self.storage.batch_read_volatile(&keys)?;
        Ok(JobStatus {
            job_id: job_id.to_string(),
            completed_interviews: values.get(&keys[0]).and_then(Value::as_i64).unwrap_or(0),
            failed_interviews: values.get(&keys[1]).and_then(Value::as_i64).unwrap_or(0),
        })
    }

    pub fn get_state(&self, job_id: &str) -> StoreResult<JobState> {
        let value = self.storage.read_volatile(&format!("job:{job_id}:state"))?;
        match value {
            Some(v) => Ok(serde_json::from_value(v)?),
            None => Ok(JobState::Pending),
        }
    }

    pub fn get_survey(&self, job_id: &str) -> StoreResult<Option<Value>> {
        self.storage.read_persistent(&format!("job:{job_id}:survey"))
    }

    pub fn get_scenario(&self, job_id: &str, scenario_id: &str) -> StoreResult<Option<Value>> {
        self.storage
            .read_persistent(&format!("job:{job_id}:scenario:{scenario_id}"))
    }

    pub fn get_agent(&self, job_id: &str, agent_id: &str) -> StoreResult<Option<Value>> {
        self.storage
            .read_persistent(&format!("job:{job_id}:agent:{agent_id}"))
    }

    pub fn get_model(&self, job_id: &str, model_id: &str) -> StoreResult<Option<Value>> {
        self.storage
            .read_persistent(&format!("job:{job_id}:model:{model_id}"))
    }

    pub fn get_question(&self, job_id: &str, question_id: &str) -> StoreResult<Option<Value>> {
        self.storage
            .read_persistent(&format!("job:{job_id}:question:{question_id}"))
    }

    /// Batch fetch of shared resources by kind; one round trip per call.
    pub fn get_resources_batch(
        &self,
        job_id: &str,
        kind: &str,
        ids: &[String],
    ) -> StoreResult<HashMap<String, Value>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("job:{job_id}:{kind}:{id}"))
            .collect();
        let values = self.storage.batch_read_persistent(&keys)?;
        let mut result = HashMap::new();
        for (id, key) in ids.iter().zip(keys.iter()) {
            if let Some(value) = values.get(key) {
                result.insert(id.clone(), value.clone());
            }
        }
        Ok(result)
    }

    // Composite operations

    /// Credit a finished interview to its job, exactly once.
    ///
    /// The `counted_interviews` set insert is the serialization point:
    /// concurrent task completions race to finalize the same interview and
    /// only the first insert increments a counter.
    pub fn mark_interview_completed(
        &self,
        job_id: &str,
        interview_id: &str,
        had_failures: bool,
    ) -> StoreResult<()> {
        let set_key = format!("job:{job_id}:counted_interviews");
        let was_new = self.storage.add_to_set(&set_key, interview_id)?;
        if !was_new {
            return Ok(());
        }

        if had_failures {
            self.increment_failed_interviews(job_id)?;
        } else {
            self.increment_completed_interviews(job_id)?;
        }
        debug!(job_id, interview_id, had_failures, "Interview credited to job");

        self.maybe_finalize(job_id)
    }

    /// Update job state if every interview has been credited.
    fn maybe_finalize(&self, job_id: &str) -> StoreResult<()> {
        let Some(definition) = self.get_definition(job_id)? else {
            return Ok(());
        };
        let status = self.get_status(job_id)?;
        if status.is_done(definition.total_interviews) {
            // Cancellation is sticky; finishing stragglers don't revive the job.
            if self.get_state(job_id)? != JobState::Cancelled {
                self.set_state(job_id, status.compute_state(definition.total_interviews))?;
            }
        }
        Ok(())
    }
}
