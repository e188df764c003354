//! JobService - the orchestrator
//!
//! Owns the lifecycle of jobs, interviews, tasks, and answers: submission
//! and decomposition, skip-logic evaluation, completion propagation through
//! the dependency DAG, progress snapshots, and results assembly. All entity
//! mutation goes through this service; the coordinator and workers only
//! touch queue and in-flight state.

mod completion;
mod progress;
mod results;
mod skip;
mod submit;

pub use completion::TaskCompletion;
pub use progress::{FailedTaskInfo, Progress, TaskErrorDetail};
pub use results::InterviewResult;
pub use skip::SkipContext;
pub use submit::{DirectTaskEntry, JobSpec, SubmitOptions, SubmittedJob};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kvstore::{Storage, StoreError};
use thiserror::Error;

use crate::llm::{AnthropicModel, LanguageModel};
use crate::render::RenderError;
use crate::stores::{AnswerStore, InterviewStore, JobStore, TaskStore};
use crate::survey::ModelSpec;

/// Errors from service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Interview not found: {0}")]
    InterviewNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Survey has cyclic dependencies involving: {0:?}")]
    CyclicSurvey(Vec<String>),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Render(#[from] RenderError),
}

/// Top-level orchestrator combining all stores.
pub struct JobService {
    storage: Arc<dyn Storage>,
    jobs: JobStore,
    interviews: InterviewStore,
    tasks: TaskStore,
    answers: AnswerStore,

    /// job_id -> stop-on-exception flag (in-memory, per submitting process)
    stop_on_exception: Mutex<HashMap<String, bool>>,

    /// job_id -> model_id -> executing client. Clients don't serialize, so
    /// they stay registered on the submitting process.
    model_clients: Mutex<HashMap<String, HashMap<String, Arc<dyn LanguageModel>>>>,
}

impl JobService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            jobs: JobStore::new(storage.clone()),
            interviews: InterviewStore::new(storage.clone()),
            tasks: TaskStore::new(storage.clone()),
            answers: AnswerStore::new(storage.clone()),
            storage,
            stop_on_exception: Mutex::new(HashMap::new()),
            model_clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    pub fn interviews(&self) -> &InterviewStore {
        &self.interviews
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn answers(&self) -> &AnswerStore {
        &self.answers
    }

    pub fn stop_on_exception(&self, job_id: &str) -> bool {
        lock(&self.stop_on_exception)
            .get(job_id)
            .copied()
            .unwrap_or(false)
    }

    pub(crate) fn set_stop_on_exception(&self, job_id: &str, value: bool) {
        lock(&self.stop_on_exception).insert(job_id.to_string(), value);
    }

    /// Register the executing client for a model within a job.
    pub fn register_model_client(
        &self,
        job_id: &str,
        model_id: &str,
        client: Arc<dyn LanguageModel>,
    ) {
        lock(&self.model_clients)
            .entry(job_id.to_string())
            .or_default()
            .insert(model_id.to_string(), client);
    }

    /// Resolve the executing client for a task's model.
    ///
    /// Prefers the client registered at submit. Falls back to
    /// reconstructing one from the stored model spec and an environment
    /// API key, which is how remote worker processes get their clients.
    pub fn get_model_for_task(
        &self,
        job_id: &str,
        model_id: &str,
    ) -> Result<Option<Arc<dyn LanguageModel>>, ServiceError> {
        if let Some(client) = lock(&self.model_clients)
            .get(job_id)
            .and_then(|models| models.get(model_id))
            .cloned()
        {
            return Ok(Some(client));
        }

        let Some(model_data) = self.jobs.get_model(job_id, model_id)? else {
            return Ok(None);
        };
        let spec: ModelSpec = serde_json::from_value(model_data).map_err(StoreError::Serde)?;

        let api_key = spec
            .api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
        match api_key {
            Some(key) if spec.service == "anthropic" => {
                let client = AnthropicModel::from_spec(&spec, key)
                    .map_err(|e| ServiceError::InvalidJob(e.to_string()))?;
                let client: Arc<dyn LanguageModel> = Arc::new(client);
                self.register_model_client(job_id, model_id, client.clone());
                Ok(Some(client))
            }
            _ => Ok(None),
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
