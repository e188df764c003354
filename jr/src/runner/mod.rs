//! Runner and job handles: the top-level control surface
//!
//! The [`Runner`] wires storage, the queue registry, the coordinator, the
//! render worker, and the direct-answer registry together. Submitting a
//! job returns a [`JobHandle`] for tracking progress, driving execution,
//! and collecting results.

mod direct;

pub use direct::{DirectAnswerOutcome, DirectAnswerRegistry};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use kvstore::Storage;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::coordinator::ExecutionCoordinator;
use crate::domain::JobState;
use crate::llm::ResponseCache;
use crate::render::{HandlebarsRenderer, RenderWorker, RenderedPrompt};
use crate::scheduler::{QueueRegistry, load_queues_from_env};
use crate::service::{
    InterviewResult, JobService, JobSpec, Progress, ServiceError, SubmitOptions, TaskCompletion,
    TaskErrorDetail,
};
use crate::workers::{ExecutionWorkerPool, WorkerRegistry};

/// A task failure surfaced by stop-on-exception.
#[derive(Debug, Clone, Error)]
#[error("Task {task_id} in job {job_id} failed ({error_kind}): {error_message}")]
pub struct TaskExecutionError {
    pub task_id: String,
    pub job_id: String,
    pub interview_id: String,
    pub error_kind: String,
    pub error_message: String,
}

/// Errors from driving a job to completion.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    TaskExecution(#[from] TaskExecutionError),

    #[error("Job {0} was cancelled")]
    Cancelled(String),
}

struct RunnerCore {
    service: Arc<JobService>,
    registry: Arc<QueueRegistry>,
    coordinator: Arc<ExecutionCoordinator>,
    render_worker: RenderWorker,
    direct_registry: DirectAnswerRegistry,
    worker_registry: Option<Arc<WorkerRegistry>>,
    config: RunnerConfig,
    /// Per-job shared response caches
    caches: Mutex<HashMap<String, Arc<ResponseCache>>>,
}

/// Local execution engine for jobs.
#[derive(Clone)]
pub struct Runner {
    core: Arc<RunnerCore>,
}

impl Runner {
    /// A single-node runner over the given storage.
    pub fn new(storage: Arc<dyn Storage>, config: RunnerConfig) -> Self {
        Self::build(storage, config, false)
    }

    /// A runner with distributed features: worker registration,
    /// heartbeats, and dead-worker recovery.
    pub fn distributed(storage: Arc<dyn Storage>, config: RunnerConfig) -> Self {
        Self::build(storage, config, true)
    }

    fn build(storage: Arc<dyn Storage>, config: RunnerConfig, distributed: bool) -> Self {
        let service = Arc::new(JobService::new(storage.clone()));

        let registry = Arc::new(QueueRegistry::new(true));
        load_queues_from_env(&registry);

        let worker_registry = distributed.then(|| {
            Arc::new(WorkerRegistry::new(
                storage.clone(),
                Duration::from_secs(config.dead_worker_timeout_secs),
            ))
        });

        let mut coordinator = ExecutionCoordinator::new(registry.clone());
        if let Some(worker_registry) = &worker_registry {
            coordinator = coordinator.with_worker_registry(
                worker_registry.clone(),
                Duration::from_secs(config.dead_worker_timeout_secs / 2),
            );
        }
        let coordinator = Arc::new(coordinator);

        let render_worker = RenderWorker::new(service.clone(), Arc::new(HandlebarsRenderer::new()));

        Self {
            core: Arc::new(RunnerCore {
                service,
                registry,
                coordinator,
                render_worker,
                direct_registry: DirectAnswerRegistry::new(),
                worker_registry,
                config,
                caches: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn service(&self) -> &Arc<JobService> {
        &self.core.service
    }

    pub fn queue_registry(&self) -> &Arc<QueueRegistry> {
        &self.core.registry
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.core.coordinator
    }

    /// Submit a job with a fresh response cache.
    pub fn submit(&self, spec: &JobSpec, options: SubmitOptions) -> Result<JobHandle, ServiceError> {
        self.submit_with_cache(spec, options, Arc::new(ResponseCache::new()))
    }

    /// Submit a job sharing an existing response cache.
    pub fn submit_with_cache(
        &self,
        spec: &JobSpec,
        options: SubmitOptions,
        cache: Arc<ResponseCache>,
    ) -> Result<JobHandle, ServiceError> {
        let submitted = self.core.service.submit_job(spec, options)?;

        self.ensure_queues_for_job(spec);
        for entry in submitted.direct_tasks {
            self.core.direct_registry.register(entry);
        }
        lock(&self.core.caches).insert(submitted.job_id.clone(), cache);

        Ok(JobHandle {
            job_id: submitted.job_id,
            core: self.core.clone(),
        })
    }

    /// Drive a job that was submitted elsewhere. Used by worker processes
    /// in distributed mode; model clients are reconstructed from stored
    /// specs and environment API keys.
    pub async fn drive_existing_job(&self, job_id: &str) -> Result<(), RunnerError> {
        self.core.execute_job(job_id).await
    }

    /// Make sure every model in the job has a queue to route to.
    fn ensure_queues_for_job(&self, spec: &JobSpec) {
        for model in &spec.models {
            let service = &model.spec.service;
            let model_name = &model.spec.model;
            if let Some(api_key) = &model.spec.api_key {
                self.core.registry.set_service_api_key(service, api_key);
            }
            if self.core.registry.find_queues(service, model_name).is_empty() {
                let api_key = model
                    .spec
                    .api_key
                    .clone()
                    .or_else(|| self.core.registry.get_service_api_key(service))
                    .unwrap_or_else(|| "local".to_string());
                self.core
                    .registry
                    .register_queue(service, model_name, &api_key, None, None);
            }
        }
    }
}

/// Handle to a submitted job.
pub struct JobHandle {
    job_id: String,
    core: Arc<RunnerCore>,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Current job state.
    pub fn status(&self) -> Result<JobState, ServiceError> {
        Ok(self.core.service.jobs().get_state(&self.job_id)?)
    }

    /// Detailed progress counts.
    pub fn progress(&self) -> Result<Progress, ServiceError> {
        self.core.service.get_progress(&self.job_id)
    }

    /// Block until the job reaches a terminal state. Returns false on
    /// timeout.
    pub async fn wait(
        &self,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<bool, ServiceError> {
        let started = Instant::now();
        loop {
            if self.status()?.is_terminal() {
                return Ok(true);
            }
            if let Some(timeout) = timeout
                && started.elapsed() >= timeout
            {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Execute all tasks and assemble the results.
    pub async fn results(&self) -> Result<Vec<InterviewResult>, RunnerError> {
        self.core.execute_job(&self.job_id).await?;

        if self.core.service.jobs().get_state(&self.job_id).map_err(ServiceError::from)?
            == JobState::Cancelled
        {
            return Err(RunnerError::Cancelled(self.job_id.clone()));
        }

        Ok(self.core.service.build_results(&self.job_id)?)
    }

    /// One record per permanently failed task.
    pub fn errors(&self) -> Result<Vec<TaskErrorDetail>, ServiceError> {
        self.core.service.get_error_details(&self.job_id)
    }

    /// Cancel the job. In-flight tasks finish; unassigned tasks are
    /// dropped when next touched.
    pub fn cancel(&self) -> Result<(), ServiceError> {
        info!(job_id = %self.job_id, "Job cancelled");
        Ok(self
            .core
            .service
            .jobs()
            .set_state(&self.job_id, JobState::Cancelled)?)
    }
}

impl RunnerCore {
    /// Run a job to completion with a worker pool.
    async fn execute_job(&self, job_id: &str) -> Result<(), RunnerError> {
        let stop_on_exception = self.service.stop_on_exception(job_id);
        let cache = lock(&self.caches).get(job_id).cloned();

        let mut pool = ExecutionWorkerPool::new(
            self.coordinator.clone(),
            self.service.clone(),
            self.config.max_workers,
            self.config.max_workers,
            Duration::from_secs(self.config.idle_timeout_secs),
            cache,
            self.worker_registry.clone(),
            Duration::from_secs(self.config.heartbeat_interval_secs),
        );
        pool.start();
        if self.worker_registry.is_some() {
            self.coordinator.start_cleanup_loop();
        }

        let outcome = self.drive_loop(job_id, stop_on_exception).await;

        if self.worker_registry.is_some() {
            self.coordinator.stop_cleanup_loop();
        }
        pool.stop().await;

        outcome
    }

    /// The top-level drive loop: direct answers, render, enqueue, check
    /// for completion. Exits when ready + pending + running hit zero or
    /// the job is cancelled.
    async fn drive_loop(&self, job_id: &str, stop_on_exception: bool) -> Result<(), RunnerError> {
        let stale_timeout = Duration::from_secs(self.config.stale_task_timeout_secs);
        let mut last_stale_check = Instant::now();

        loop {
            if self.service.jobs().get_state(job_id).map_err(ServiceError::from)?
                == JobState::Cancelled
            {
                info!(job_id, "Drive loop exiting: job cancelled");
                return Ok(());
            }

            // 1. Direct-answer tasks need no rendering or queuing
            self.execute_ready_direct_answers(job_id, stop_on_exception)?;

            // 2. Render all ready LLM tasks and hand them to the coordinator
            let rendered = self
                .render_worker
                .render_ready_tasks(job_id, self.config.render_batch_size)?;
            for prompt in rendered {
                self.enqueue_or_fail(job_id, prompt, stop_on_exception)?;
            }

            // 3. Surface executor failures when stopping on exception
            if stop_on_exception {
                let progress = self.service.get_progress(job_id)?;
                if progress.failed_tasks > 0
                    && let Some(failed) = self.service.get_first_failed_task(job_id)?
                {
                    self.service
                        .jobs()
                        .set_state(job_id, JobState::Cancelled)
                        .map_err(ServiceError::from)?;
                    return Err(TaskExecutionError {
                        task_id: failed.task_id,
                        job_id: job_id.to_string(),
                        interview_id: failed.interview_id,
                        error_kind: failed.error_kind,
                        error_message: failed.error_message,
                    }
                    .into());
                }
            }

            // 4. Done?
            let progress = self.service.get_progress(job_id)?;
            if progress.ready_tasks == 0
                && progress.pending_tasks == 0
                && progress.running_tasks == 0
            {
                return Ok(());
            }

            // Safety net for assignments that never report back
            if last_stale_check.elapsed() >= Duration::from_secs(60) {
                last_stale_check = Instant::now();
                self.coordinator.requeue_stale_tasks(stale_timeout);
            }

            // Wait longer when everything is in flight, briefly when more
            // work may be ready immediately
            if progress.running_tasks > 0 && progress.ready_tasks == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            } else {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    fn enqueue_or_fail(
        &self,
        job_id: &str,
        prompt: RenderedPrompt,
        stop_on_exception: bool,
    ) -> Result<(), RunnerError> {
        let task_id = prompt.task_id.clone();
        let interview_id = prompt.interview_id.clone();
        let service_name = prompt.service_name.clone();
        let model_name = prompt.model_name.clone();

        if self.coordinator.enqueue(prompt).is_some() {
            return Ok(());
        }

        let error_message = format!("No queue available for {service_name}/{model_name}");
        warn!(task_id = %task_id, "{error_message}");
        self.service
            .on_task_failed(job_id, &interview_id, &task_id, "no_queue", &error_message)?;

        if stop_on_exception {
            self.service
                .jobs()
                .set_state(job_id, JobState::Cancelled)
                .map_err(ServiceError::from)?;
            return Err(TaskExecutionError {
                task_id,
                job_id: job_id.to_string(),
                interview_id,
                error_kind: "no_queue".to_string(),
                error_message,
            }
            .into());
        }
        Ok(())
    }

    /// Pull ready direct-answer tasks and execute them client-side.
    fn execute_ready_direct_answers(
        &self,
        job_id: &str,
        stop_on_exception: bool,
    ) -> Result<usize, RunnerError> {
        let mut count = 0;
        loop {
            let Some(task_id) = self
                .service
                .tasks()
                .pop_ready_task(job_id)
                .map_err(ServiceError::from)?
            else {
                break;
            };

            if !self.direct_registry.has_entry(&task_id) {
                // An LLM task; hand it back for the render worker
                self.service
                    .tasks()
                    .add_to_ready(job_id, &task_id)
                    .map_err(ServiceError::from)?;
                break;
            }

            let Some((_, interview_id)) = self
                .service
                .tasks()
                .get_location(&task_id)
                .map_err(ServiceError::from)?
            else {
                continue;
            };

            match self.direct_registry.execute(&task_id) {
                Ok(outcome) => {
                    let completion = TaskCompletion {
                        answer_value: outcome.answer,
                        comment: Some(outcome.comment),
                        input_tokens: Some(0),
                        output_tokens: Some(0),
                        ..Default::default()
                    };
                    self.service
                        .on_task_completed(job_id, &interview_id, &task_id, completion)?;
                    self.direct_registry.remove(&task_id);
                    count += 1;
                }
                Err(e) => {
                    let error_message = e.to_string();
                    self.service.on_task_failed(
                        job_id,
                        &interview_id,
                        &task_id,
                        "direct_answer_error",
                        &error_message,
                    )?;
                    self.direct_registry.remove(&task_id);

                    if stop_on_exception {
                        self.service
                            .jobs()
                            .set_state(job_id, JobState::Cancelled)
                            .map_err(ServiceError::from)?;
                        return Err(TaskExecutionError {
                            task_id,
                            job_id: job_id.to_string(),
                            interview_id,
                            error_kind: "direct_answer_error".to_string(),
                            error_message,
                        }
                        .into());
                    }
                }
            }
        }
        Ok(count)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
