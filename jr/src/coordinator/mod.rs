//! ExecutionCoordinator - central controller for task dispatch
//!
//! Workers long-poll for work. The coordinator picks a queue from the
//! dispatch heap, acquires rate-limit tokens, hands out assignments,
//! tracks in-flight tasks for recovery, reconciles token usage on
//! completion, and requeues the tasks of dead workers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::render::RenderedPrompt;
use crate::scheduler::QueueRegistry;
use crate::workers::WorkerRegistry;

/// How many heap candidates one assignment attempt probes before giving
/// up. Probing past the first rate-limited queue reduces contention when
/// many workers compete across queues.
const MAX_ASSIGN_ATTEMPTS: usize = 10;

/// A task handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkAssignment {
    pub task: RenderedPrompt,
    pub queue_id: String,
    pub api_key: String,
    pub assigned_at: Instant,
}

/// A worker's report that a task finished.
///
/// `estimated_tokens` is threaded through from the assignment so the
/// queue's TPM bucket can be reconciled against actual usage.
#[derive(Debug, Clone)]
pub struct WorkCompletion {
    pub task_id: String,
    pub queue_id: String,
    pub success: bool,
    pub estimated_tokens: u32,
    pub actual_tokens: Option<u32>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

struct InFlightTask {
    queue_id: String,
    task: RenderedPrompt,
    assigned_at: Instant,
}

/// Aggregate dispatch statistics.
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    pub num_queues: usize,
    pub total_depth: usize,
    pub heap_size: usize,
    pub in_flight_tasks: usize,
}

/// Central coordinator for task execution.
pub struct ExecutionCoordinator {
    registry: Arc<QueueRegistry>,
    worker_registry: Option<Arc<WorkerRegistry>>,
    dead_worker_check_interval: Duration,

    /// Wakes long-polling workers when new work arrives
    work_available: Notify,

    in_flight: Mutex<HashMap<String, InFlightTask>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionCoordinator {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            registry,
            worker_registry: None,
            dead_worker_check_interval: Duration::from_secs(30),
            work_available: Notify::new(),
            in_flight: Mutex::new(HashMap::new()),
            cleanup_task: Mutex::new(None),
        }
    }

    /// Enable dead-worker detection against a worker registry.
    pub fn with_worker_registry(
        mut self,
        worker_registry: Arc<WorkerRegistry>,
        check_interval: Duration,
    ) -> Self {
        self.worker_registry = Some(worker_registry);
        self.dead_worker_check_interval = check_interval;
        self
    }

    pub fn queue_registry(&self) -> &Arc<QueueRegistry> {
        &self.registry
    }

    /// Route a rendered task to its queue and wake waiting workers.
    /// `None` means no queue exists and none could be auto-registered.
    pub fn enqueue(&self, rendered: RenderedPrompt) -> Option<String> {
        let service = rendered.service_name.clone();
        let model = rendered.model_name.clone();
        let task_id = rendered.task_id.clone();

        let queue_id = self.registry.enqueue_task(rendered, &service, &model);
        match &queue_id {
            Some(qid) => {
                debug!(task_id = %task_id, queue_id = %qid, service = %service, "Task enqueued");
                self.work_available.notify_waiters();
            }
            None => {
                debug!(task_id = %task_id, service = %service, model = %model, "No queue for task");
            }
        }
        queue_id
    }

    /// Long-poll for work. Returns `None` on timeout.
    pub async fn request_work(&self, timeout: Duration) -> Option<WorkAssignment> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(assignment) = self.try_assign() {
                return Some(assignment);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            // Wake on new work or tick over at most every 500ms so a
            // rate-limit window opening is noticed promptly
            let wait = (deadline - now).min(Duration::from_millis(500));
            tokio::select! {
                _ = self.work_available.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One bounded assignment attempt over the dispatch heap.
    pub fn try_assign(&self) -> Option<WorkAssignment> {
        let heap = self.registry.dispatch_heap();
        let now = Instant::now();

        // Queues probed but rate-limited, to be pushed back with their
        // updated availability
        let mut tried: Vec<(String, Instant)> = Vec::new();
        let mut assignment = None;

        for _attempt in 0..MAX_ASSIGN_ATTEMPTS {
            let Some((queue_id, available_at)) = heap.pop() else {
                break;
            };

            if available_at > now {
                // Heap is sorted; later entries are no better
                heap.push(&queue_id, available_at);
                break;
            }

            let Some(queue) = self.registry.get_queue(&queue_id) else {
                continue;
            };
            let Some(task) = queue.peek() else {
                // Empty queue leaves the heap until its next enqueue
                continue;
            };

            if queue.try_acquire(task.estimated_tokens) {
                let Some(task) = queue.dequeue() else {
                    continue;
                };
                self.track_in_flight(&queue_id, &task, now);

                // Still work left: put the queue back at its next window
                if queue.depth() > 0 {
                    let next_tokens = queue.peek().map(|t| t.estimated_tokens).unwrap_or(500);
                    let wait = queue.time_until_available(next_tokens);
                    heap.push(&queue_id, now + Duration::from_secs_f64(wait));
                }

                debug!(
                    task_id = %task.task_id,
                    queue_id = %queue_id,
                    service = %queue.service(),
                    "Task assigned"
                );
                assignment = Some(WorkAssignment {
                    api_key: queue.api_key().to_string(),
                    queue_id,
                    task,
                    assigned_at: now,
                });
                break;
            }

            // Rate limited; try the next candidate
            let wait = queue.time_until_available(task.estimated_tokens);
            debug!(queue_id = %queue_id, wait_secs = wait, "Queue rate limited");
            tried.push((queue_id, now + Duration::from_secs_f64(wait)));
        }

        // Put back everything probed but unused
        for (queue_id, available_at) in tried {
            heap.push(&queue_id, available_at);
        }

        assignment
    }

    /// A worker reports completion: untrack and reconcile token usage.
    pub fn complete_work(&self, completion: &WorkCompletion) {
        self.untrack_in_flight(&completion.task_id);

        if let Some(actual) = completion.actual_tokens
            && let Some(queue) = self.registry.get_queue(&completion.queue_id)
        {
            queue.reconcile(completion.estimated_tokens, actual);
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            num_queues: self.registry.list_queues().len(),
            total_depth: self.registry.total_depth(),
            heap_size: self.registry.dispatch_heap().len(),
            in_flight_tasks: lock(&self.in_flight).len(),
        }
    }

    pub fn in_flight_task_ids(&self) -> Vec<String> {
        lock(&self.in_flight).keys().cloned().collect()
    }

    fn track_in_flight(&self, queue_id: &str, task: &RenderedPrompt, assigned_at: Instant) {
        lock(&self.in_flight).insert(
            task.task_id.clone(),
            InFlightTask {
                queue_id: queue_id.to_string(),
                task: task.clone(),
                assigned_at,
            },
        );
    }

    fn untrack_in_flight(&self, task_id: &str) {
        lock(&self.in_flight).remove(task_id);
    }

    /// Return an in-flight task to the tail of its origin queue.
    /// At-least-once: the answer write is idempotent by key.
    pub fn requeue_task(&self, task_id: &str) -> bool {
        let Some(entry) = lock(&self.in_flight).remove(task_id) else {
            return false;
        };
        let Some(queue) = self.registry.get_queue(&entry.queue_id) else {
            return false;
        };

        let estimated_tokens = entry.task.estimated_tokens;
        queue.enqueue(entry.task);

        let wait = queue.time_until_available(estimated_tokens);
        self.registry.dispatch_heap().push(
            &entry.queue_id,
            Instant::now() + Duration::from_secs_f64(wait),
        );
        self.work_available.notify_waiters();

        info!(task_id, queue_id = %entry.queue_id, "Task requeued");
        true
    }

    /// Requeue every task in-flight longer than `stale_timeout`. For use
    /// without a worker registry. Returns how many were requeued.
    pub fn requeue_stale_tasks(&self, stale_timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = lock(&self.in_flight)
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.assigned_at) > stale_timeout)
            .map(|(task_id, _)| task_id.clone())
            .collect();

        let mut count = 0;
        for task_id in stale {
            if self.requeue_task(&task_id) {
                count += 1;
            }
        }
        if count > 0 {
            info!(count, "Requeued stale tasks");
        }
        count
    }

    // Dead worker detection

    /// Start the background loop that recovers tasks from dead workers.
    /// No-op without a worker registry.
    pub fn start_cleanup_loop(self: &Arc<Self>) {
        if self.worker_registry.is_none() {
            return;
        }
        let coordinator = Arc::clone(self);
        let interval = self.dead_worker_check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) = coordinator.check_dead_workers() {
                    warn!(error = %e, "Dead worker check failed");
                }
            }
        });
        *lock(&self.cleanup_task) = Some(handle);
    }

    /// Stop the background cleanup loop.
    pub fn stop_cleanup_loop(&self) {
        if let Some(handle) = lock(&self.cleanup_task).take() {
            handle.abort();
        }
    }

    /// One pass of dead-worker recovery: requeue their in-flight tasks,
    /// then purge the dead records.
    pub fn check_dead_workers(&self) -> Result<usize, kvstore::StoreError> {
        let Some(worker_registry) = &self.worker_registry else {
            return Ok(0);
        };

        let mut recovered = 0;
        for (worker_id, _job_id, task_id) in worker_registry.get_dead_worker_tasks()? {
            warn!(worker_id = %worker_id, task_id = %task_id, "Dead worker detected");
            if self.requeue_task(&task_id) {
                recovered += 1;
            }
        }

        let cleaned = worker_registry.cleanup_dead_workers()?;
        if !cleaned.is_empty() {
            info!(count = cleaned.len(), "Cleaned up dead workers");
        }
        Ok(recovered)
    }
}

impl Drop for ExecutionCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.cleanup_task).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(task_id: &str, estimated_tokens: u32) -> RenderedPrompt {
        RenderedPrompt {
            task_id: task_id.to_string(),
            job_id: "j".to_string(),
            interview_id: "i".to_string(),
            system_prompt: "sys".to_string(),
            user_prompt: "user".to_string(),
            estimated_tokens,
            cache_key: "ck".to_string(),
            question_name: "q1".to_string(),
            model_id: "m".to_string(),
            model_name: "test-model".to_string(),
            service_name: "test".to_string(),
            iteration: 0,
            files: None,
        }
    }

    fn coordinator_with_queue(rpm: u32, tpm: u32) -> (Arc<ExecutionCoordinator>, String) {
        let registry = Arc::new(QueueRegistry::new(false));
        let queue_id = registry.register_queue("test", "test-model", "key", Some(rpm), Some(tpm));
        (Arc::new(ExecutionCoordinator::new(registry)), queue_id)
    }

    #[test]
    fn test_enqueue_and_assign() {
        let (coordinator, queue_id) = coordinator_with_queue(60, 100_000);
        coordinator.enqueue(prompt("t1", 500)).unwrap();

        let assignment = coordinator.try_assign().unwrap();
        assert_eq!(assignment.task.task_id, "t1");
        assert_eq!(assignment.queue_id, queue_id);
        assert_eq!(assignment.api_key, "key");
        assert_eq!(coordinator.stats().in_flight_tasks, 1);
    }

    #[test]
    fn test_assign_empty_heap() {
        let (coordinator, _queue_id) = coordinator_with_queue(60, 100_000);
        assert!(coordinator.try_assign().is_none());
    }

    #[test]
    fn test_tpm_bound_shapes_assignment() {
        // TPM of 1000 admits two 500-token tasks immediately, then dries up
        let (coordinator, _queue_id) = coordinator_with_queue(10_000, 1000);
        for i in 0..4 {
            coordinator.enqueue(prompt(&format!("t{i}"), 500)).unwrap();
        }

        assert!(coordinator.try_assign().is_some());
        assert!(coordinator.try_assign().is_some());
        // Third acquire fails; queue goes back with a future availability
        assert!(coordinator.try_assign().is_none());
        assert_eq!(coordinator.stats().in_flight_tasks, 2);
        assert_eq!(coordinator.stats().heap_size, 1);
    }

    #[test]
    fn test_complete_work_reconciles() {
        let (coordinator, queue_id) = coordinator_with_queue(10_000, 1000);
        coordinator.enqueue(prompt("t1", 800)).unwrap();
        coordinator.enqueue(prompt("t2", 800)).unwrap();

        assert!(coordinator.try_assign().is_some());
        // 200 TPM tokens left; t2 cannot acquire
        assert!(coordinator.try_assign().is_none());

        // Actual usage was only 100 tokens; reconciliation returns 700
        coordinator.complete_work(&WorkCompletion {
            task_id: "t1".to_string(),
            queue_id: queue_id.clone(),
            success: true,
            estimated_tokens: 800,
            actual_tokens: Some(100),
            error_kind: None,
            error_message: None,
        });
        assert_eq!(coordinator.stats().in_flight_tasks, 0);
        assert!(coordinator.try_assign().is_some());
    }

    #[test]
    fn test_requeue_task_returns_to_origin_queue() {
        let (coordinator, _queue_id) = coordinator_with_queue(60, 100_000);
        coordinator.enqueue(prompt("t1", 500)).unwrap();
        coordinator.try_assign().unwrap();
        assert_eq!(coordinator.stats().total_depth, 0);

        assert!(coordinator.requeue_task("t1"));
        assert_eq!(coordinator.stats().in_flight_tasks, 0);
        assert_eq!(coordinator.stats().total_depth, 1);

        // And it can be assigned again
        let again = coordinator.try_assign().unwrap();
        assert_eq!(again.task.task_id, "t1");
    }

    #[test]
    fn test_requeue_unknown_task() {
        let (coordinator, _queue_id) = coordinator_with_queue(60, 100_000);
        assert!(!coordinator.requeue_task("ghost"));
    }

    #[test]
    fn test_requeue_stale_tasks() {
        let (coordinator, _queue_id) = coordinator_with_queue(60, 100_000);
        coordinator.enqueue(prompt("t1", 500)).unwrap();
        coordinator.try_assign().unwrap();

        // Nothing is stale yet with a generous threshold
        assert_eq!(coordinator.requeue_stale_tasks(Duration::from_secs(300)), 0);
        // Zero threshold catches the in-flight task
        assert_eq!(coordinator.requeue_stale_tasks(Duration::ZERO), 1);
    }

    #[tokio::test]
    async fn test_request_work_times_out() {
        let (coordinator, _queue_id) = coordinator_with_queue(60, 100_000);
        let assignment = coordinator.request_work(Duration::from_millis(50)).await;
        assert!(assignment.is_none());
    }

    #[tokio::test]
    async fn test_request_work_woken_by_enqueue() {
        let (coordinator, _queue_id) = coordinator_with_queue(60, 100_000);

        let poller = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.request_work(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        coordinator.enqueue(prompt("t1", 500)).unwrap();
        let assignment = poller.await.unwrap();
        assert_eq!(assignment.unwrap().task.task_id, "t1");
    }
}
