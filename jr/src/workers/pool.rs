//! Fixed pool of execution workers

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::debug;

use super::executor::ExecutionWorker;
use super::registry::WorkerRegistry;
use crate::coordinator::ExecutionCoordinator;
use crate::llm::ResponseCache;
use crate::service::JobService;

/// Spawns and owns a set of [`ExecutionWorker`]s sharing one coordinator,
/// job service, and response cache.
pub struct ExecutionWorkerPool {
    coordinator: Arc<ExecutionCoordinator>,
    service: Arc<JobService>,
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Duration,
    cache: Option<Arc<ResponseCache>>,
    worker_registry: Option<Arc<WorkerRegistry>>,
    heartbeat_interval: Duration,
    workers: Vec<(Arc<ExecutionWorker>, JoinHandle<()>)>,
}

impl ExecutionWorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coordinator: Arc<ExecutionCoordinator>,
        service: Arc<JobService>,
        min_workers: usize,
        max_workers: usize,
        idle_timeout: Duration,
        cache: Option<Arc<ResponseCache>>,
        worker_registry: Option<Arc<WorkerRegistry>>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            service,
            min_workers,
            max_workers,
            idle_timeout,
            cache,
            worker_registry,
            heartbeat_interval,
            workers: Vec::new(),
        }
    }

    /// Spawn the minimum worker count.
    pub fn start(&mut self) {
        for _ in 0..self.min_workers {
            self.spawn_worker();
        }
        debug!(count = self.workers.len(), "Worker pool started");
    }

    /// Spawn one more worker, up to the maximum.
    pub fn spawn_worker(&mut self) {
        if self.workers.len() >= self.max_workers {
            return;
        }
        let worker = Arc::new(ExecutionWorker::new(
            self.coordinator.clone(),
            self.service.clone(),
            self.idle_timeout,
            self.cache.clone(),
            self.worker_registry.clone(),
            self.heartbeat_interval,
        ));
        let handle = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run().await })
        };
        self.workers.push((worker, handle));
    }

    /// Stop all workers and await their termination.
    pub async fn stop(&mut self) {
        for (worker, handle) in &self.workers {
            worker.stop();
            handle.abort();
        }
        let handles: Vec<JoinHandle<()>> =
            self.workers.drain(..).map(|(_, handle)| handle).collect();
        join_all(handles).await;
        debug!("Worker pool stopped");
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.workers
            .iter()
            .map(|(worker, _)| worker.worker_id().to_string())
            .collect()
    }
}
