//! Background heartbeats for a worker

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::warn;

use super::registry::WorkerRegistry;

#[derive(Default)]
struct CurrentTask {
    task_id: Option<String>,
    job_id: Option<String>,
}

/// Ticks a worker's heartbeat every `interval`, reporting the task the
/// worker currently holds. Heartbeat failures are logged and swallowed;
/// a flaky registry must not kill the worker.
pub struct HeartbeatManager {
    registry: Arc<WorkerRegistry>,
    worker_id: String,
    interval: Duration,
    current: Arc<Mutex<CurrentTask>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatManager {
    pub fn new(registry: Arc<WorkerRegistry>, worker_id: impl Into<String>, interval: Duration) -> Self {
        Self {
            registry,
            worker_id: worker_id.into(),
            interval,
            current: Arc::new(Mutex::new(CurrentTask::default())),
            handle: None,
        }
    }

    /// Record which task the worker holds; the next tick reports it.
    pub fn update_task(&self, task_id: Option<&str>, job_id: Option<&str>) {
        let mut current = lock(&self.current);
        current.task_id = task_id.map(String::from);
        current.job_id = job_id.map(String::from);
    }

    /// Start ticking in a background task.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let registry = self.registry.clone();
        let worker_id = self.worker_id.clone();
        let current = self.current.clone();
        let interval = self.interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let (task_id, job_id) = {
                    let current = lock(&current);
                    (current.task_id.clone(), current.job_id.clone())
                };
                if let Err(e) =
                    registry.heartbeat(&worker_id, task_id.as_deref(), job_id.as_deref())
                {
                    warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
                }
            }
        }));
    }

    /// Stop ticking.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
