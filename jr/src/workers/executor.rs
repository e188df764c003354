//! Execution worker: long-poll, invoke the model, report back

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::heartbeat::HeartbeatManager;
use super::registry::WorkerRegistry;
use crate::coordinator::{ExecutionCoordinator, WorkAssignment, WorkCompletion};
use crate::domain::{TaskStatus, generate_id};
use crate::llm::{ErrorKind, ModelRequest, ResponseCache};
use crate::service::{JobService, TaskCompletion};

/// Outcome of executing one assignment.
#[derive(Debug)]
pub struct ExecutionResult {
    pub task_id: String,
    pub job_id: String,
    pub interview_id: String,
    pub success: bool,
    pub completion: Option<TaskCompletion>,
    pub actual_tokens: Option<u32>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// A worker that executes LLM tasks.
///
/// Lifecycle: register (distributed only) -> long-poll -> mark RUNNING ->
/// invoke the model -> report completion to the coordinator -> feed the
/// job service -> repeat until stopped.
pub struct ExecutionWorker {
    coordinator: Arc<ExecutionCoordinator>,
    service: Arc<JobService>,
    idle_timeout: Duration,
    cache: Option<Arc<ResponseCache>>,
    worker_registry: Option<Arc<WorkerRegistry>>,
    worker_id: String,
    heartbeat_interval: Duration,
    running: AtomicBool,
}

impl ExecutionWorker {
    pub fn new(
        coordinator: Arc<ExecutionCoordinator>,
        service: Arc<JobService>,
        idle_timeout: Duration,
        cache: Option<Arc<ResponseCache>>,
        worker_registry: Option<Arc<WorkerRegistry>>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            service,
            idle_timeout,
            cache,
            worker_registry,
            worker_id: generate_id(),
            heartbeat_interval,
            running: AtomicBool::new(false),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Main worker loop. Runs until [`ExecutionWorker::stop`] or the task
    /// holding it is cancelled.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);

        let mut heartbeat = match &self.worker_registry {
            Some(registry) => {
                if let Err(e) = registry.register(
                    Some(self.worker_id.clone()),
                    Value::Null,
                    serde_json::json!({"type": "execution_worker"}),
                ) {
                    warn!(worker_id = %self.worker_id, error = %e, "Worker registration failed");
                }
                let mut manager = HeartbeatManager::new(
                    registry.clone(),
                    self.worker_id.clone(),
                    self.heartbeat_interval,
                );
                manager.start();
                Some(manager)
            }
            None => None,
        };

        while self.running.load(Ordering::SeqCst) {
            let Some(assignment) = self.coordinator.request_work(self.idle_timeout).await else {
                continue;
            };

            if let Some(manager) = &heartbeat {
                manager.update_task(Some(&assignment.task.task_id), Some(&assignment.task.job_id));
            }
            if let Err(e) = self
                .service
                .tasks()
                .set_status(&assignment.task.task_id, TaskStatus::Running)
            {
                warn!(task_id = %assignment.task.task_id, error = %e, "Failed to mark running");
            }

            let result = self.execute(&assignment).await;

            if let Some(manager) = &heartbeat {
                manager.update_task(None, None);
            }

            self.coordinator.complete_work(&WorkCompletion {
                task_id: result.task_id.clone(),
                queue_id: assignment.queue_id.clone(),
                success: result.success,
                estimated_tokens: assignment.task.estimated_tokens,
                actual_tokens: result.actual_tokens,
                error_kind: result.error_kind.map(|k| k.as_str().to_string()),
                error_message: result.error_message.clone(),
            });

            let outcome = if result.success {
                self.service.on_task_completed(
                    &result.job_id,
                    &result.interview_id,
                    &result.task_id,
                    result.completion.unwrap_or_default(),
                )
            } else {
                self.service.on_task_failed(
                    &result.job_id,
                    &result.interview_id,
                    &result.task_id,
                    result.error_kind.unwrap_or(ErrorKind::Unknown).as_str(),
                    result.error_message.as_deref().unwrap_or("Unknown error"),
                )
            };
            if let Err(e) = outcome {
                warn!(task_id = %result.task_id, error = %e, "Failed to record task outcome");
            }
        }

        if let Some(manager) = &mut heartbeat {
            manager.stop();
        }
        if let Some(registry) = &self.worker_registry {
            if let Err(e) = registry.unregister(&self.worker_id) {
                warn!(worker_id = %self.worker_id, error = %e, "Unregister failed");
            }
        }
    }

    /// Execute one assignment: consult the shared cache, fall through to
    /// the model client, and package the outcome.
    async fn execute(&self, assignment: &WorkAssignment) -> ExecutionResult {
        let task = &assignment.task;

        let failure = |kind: ErrorKind, message: String| ExecutionResult {
            task_id: task.task_id.clone(),
            job_id: task.job_id.clone(),
            interview_id: task.interview_id.clone(),
            success: false,
            completion: None,
            actual_tokens: None,
            error_kind: Some(kind),
            error_message: Some(message),
        };

        // Cache hit skips the provider entirely
        let cached_response = self
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&task.cache_key));

        let response = match cached_response {
            Some(response) => {
                debug!(task_id = %task.task_id, "Cache hit");
                response
            }
            None => {
                let client = match self
                    .service
                    .get_model_for_task(&task.job_id, &task.model_id)
                {
                    Ok(Some(client)) => client,
                    Ok(None) => {
                        return failure(
                            ErrorKind::InvalidRequest,
                            format!("No client for model {}", task.model_id),
                        );
                    }
                    Err(e) => return failure(ErrorKind::Unknown, e.to_string()),
                };

                let request = ModelRequest {
                    system_prompt: task.system_prompt.clone(),
                    user_prompt: task.user_prompt.clone(),
                    iteration: task.iteration,
                    files: task.files.clone(),
                    cache_key: task.cache_key.clone(),
                };
                match client.get_response(request).await {
                    Ok(response) => {
                        if let Some(cache) = &self.cache {
                            cache.put(&task.cache_key, &response);
                        }
                        response
                    }
                    Err(e) => return failure(e.kind(), e.to_string()),
                }
            }
        };

        let actual_tokens = Some(response.total_tokens() as u32);
        let completion = TaskCompletion {
            answer_value: response.answer,
            comment: response.comment,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            raw_model_response: response.raw_response,
            generated_tokens: response.generated_tokens,
            cached: response.cache_used,
            system_prompt: Some(task.system_prompt.clone()),
            user_prompt: Some(task.user_prompt.clone()),
            input_price_per_million_tokens: response.input_price_per_million_tokens,
            output_price_per_million_tokens: response.output_price_per_million_tokens,
            cache_key: response.cache_key.or_else(|| Some(task.cache_key.clone())),
            validated: Some(true),
            reasoning_summary: response.reasoning_summary,
        };

        ExecutionResult {
            task_id: task.task_id.clone(),
            job_id: task.job_id.clone(),
            interview_id: task.interview_id.clone(),
            success: true,
            completion: Some(completion),
            actual_tokens,
            error_kind: None,
            error_message: None,
        }
    }
}
