//! Per-(service, model, key) task queue with rate limiting

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

use super::bucket::TokenBucket;
use crate::render::RenderedPrompt;

/// Metadata snapshot for a queue.
#[derive(Debug, Clone)]
pub struct QueueMeta {
    pub queue_id: String,
    pub service: String,
    pub model: String,
    pub api_key: String,
    pub rpm_limit: u32,
    pub tpm_limit: u32,
}

/// Throughput since the first acquired request. Stats freeze when the
/// queue empties so a finished queue reports honest average rates, and
/// unfreeze on the next acquire.
#[derive(Debug, Clone, Default)]
pub struct ThroughputStats {
    pub request_count: u64,
    pub token_count: i64,
    pub elapsed_seconds: f64,
    pub avg_rpm: f64,
    pub avg_tpm: f64,
    pub rpm_utilization: f64,
    pub tpm_utilization: f64,
    pub is_frozen: bool,
}

struct RateState {
    rpm_bucket: TokenBucket,
    tpm_bucket: TokenBucket,
    request_count: u64,
    token_count: i64,
    start_time: Option<Instant>,
    end_time: Option<Instant>,
}

/// A rate-limited FIFO for one (service, model, api_key) combination.
pub struct Queue {
    queue_id: String,
    service: String,
    model: String,
    api_key: String,
    rpm_limit: u32,
    tpm_limit: u32,
    tasks: Mutex<VecDeque<RenderedPrompt>>,
    rate: Mutex<RateState>,
}

impl Queue {
    pub fn new(
        queue_id: impl Into<String>,
        service: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        rpm_limit: u32,
        tpm_limit: u32,
    ) -> Self {
        Self {
            queue_id: queue_id.into(),
            service: service.into(),
            model: model.into(),
            api_key: api_key.into(),
            rpm_limit,
            tpm_limit,
            tasks: Mutex::new(VecDeque::new()),
            rate: Mutex::new(RateState {
                rpm_bucket: TokenBucket::new(rpm_limit as f64, rpm_limit as f64 / 60.0),
                tpm_bucket: TokenBucket::new(tpm_limit as f64, tpm_limit as f64 / 60.0),
                request_count: 0,
                token_count: 0,
                start_time: None,
                end_time: None,
            }),
        }
    }

    pub fn queue_id(&self) -> &str {
        &self.queue_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn depth(&self) -> usize {
        self.lock_tasks().len()
    }

    pub fn meta(&self) -> QueueMeta {
        QueueMeta {
            queue_id: self.queue_id.clone(),
            service: self.service.clone(),
            model: self.model.clone(),
            api_key: self.api_key.clone(),
            rpm_limit: self.rpm_limit,
            tpm_limit: self.tpm_limit,
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, VecDeque<RenderedPrompt>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_rate(&self) -> std::sync::MutexGuard<'_, RateState> {
        match self.rate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append a task to the FIFO.
    pub fn enqueue(&self, task: RenderedPrompt) {
        let mut tasks = self.lock_tasks();
        debug!(
            queue_id = %self.queue_id,
            service = %self.service,
            model = %self.model,
            task_id = %task.task_id,
            depth_after = tasks.len() + 1,
            "Task enqueued"
        );
        tasks.push_back(task);
    }

    /// Look at the next task without removing it.
    pub fn peek(&self) -> Option<RenderedPrompt> {
        self.lock_tasks().front().cloned()
    }

    /// Remove and return the next task. Freezes throughput stats when the
    /// queue empties.
    pub fn dequeue(&self) -> Option<RenderedPrompt> {
        let mut tasks = self.lock_tasks();
        let task = tasks.pop_front();
        if let Some(ref t) = task {
            debug!(
                queue_id = %self.queue_id,
                task_id = %t.task_id,
                depth_after = tasks.len(),
                "Task dequeued"
            );
            if tasks.is_empty() {
                let mut rate = self.lock_rate();
                if rate.start_time.is_some() && rate.end_time.is_none() {
                    rate.end_time = Some(Instant::now());
                }
            }
        }
        task
    }

    /// Atomically take 1 RPM token and `estimated_tokens` TPM tokens.
    /// Returns everything on partial failure.
    pub fn try_acquire(&self, estimated_tokens: u32) -> bool {
        let mut rate = self.lock_rate();
        if !rate.rpm_bucket.try_acquire(1.0) {
            return false;
        }
        if !rate.tpm_bucket.try_acquire(estimated_tokens as f64) {
            rate.rpm_bucket.release(1.0);
            return false;
        }

        if rate.start_time.is_none() {
            rate.start_time = Some(Instant::now());
        }
        // Active again; unfreeze stats
        rate.end_time = None;
        rate.request_count += 1;
        rate.token_count += estimated_tokens as i64;
        true
    }

    /// Seconds until a request of this size can acquire.
    pub fn time_until_available(&self, estimated_tokens: u32) -> f64 {
        let mut rate = self.lock_rate();
        let rpm_wait = rate.rpm_bucket.time_until_available(1.0);
        let tpm_wait = rate.tpm_bucket.time_until_available(estimated_tokens as f64);
        rpm_wait.max(tpm_wait)
    }

    /// Adjust the TPM bucket and usage counters once actual usage is known.
    pub fn reconcile(&self, estimated_tokens: u32, actual_tokens: u32) {
        let mut rate = self.lock_rate();
        rate.tpm_bucket
            .reconcile(estimated_tokens as f64, actual_tokens as f64);
        rate.token_count += actual_tokens as i64 - estimated_tokens as i64;
    }

    pub fn throughput_stats(&self) -> ThroughputStats {
        let rate = self.lock_rate();
        let Some(start) = rate.start_time else {
            return ThroughputStats::default();
        };

        let end = rate.end_time.unwrap_or_else(Instant::now);
        let elapsed = end.duration_since(start).as_secs_f64().max(1.0);

        let avg_rpm = (rate.request_count as f64 / elapsed) * 60.0;
        let avg_tpm = (rate.token_count as f64 / elapsed) * 60.0;

        ThroughputStats {
            request_count: rate.request_count,
            token_count: rate.token_count,
            elapsed_seconds: elapsed,
            avg_rpm,
            avg_tpm,
            rpm_utilization: if self.rpm_limit > 0 {
                avg_rpm / self.rpm_limit as f64 * 100.0
            } else {
                0.0
            },
            tpm_utilization: if self.tpm_limit > 0 {
                avg_tpm / self.tpm_limit as f64 * 100.0
            } else {
                0.0
            },
            is_frozen: rate.end_time.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderedPrompt;

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

    fn queue(rpm: u32, tpm: u32) -> Queue {
        Queue::new("q-1", "test", "test-model", "key", rpm, tpm)
    }

    #[test]
    fn test_fifo_order() {
        let q = queue(60, 100_000);
        q.enqueue(prompt("t1", 100));
        q.enqueue(prompt("t2", 100));

        assert_eq!(q.depth(), 2);
        assert_eq!(q.peek().unwrap().task_id, "t1");
        assert_eq!(q.dequeue().unwrap().task_id, "t1");
        assert_eq!(q.dequeue().unwrap().task_id, "t2");
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn test_try_acquire_takes_both_buckets() {
        let q = queue(60, 10_000);
        assert!(q.try_acquire(500));

        let stats = q.throughput_stats();
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.token_count, 500);
    }

    #[test]
    fn test_tpm_failure_returns_rpm_token() {
        // TPM allows only one 600-token request; RPM is large
        let q = queue(10_000, 600);
        assert!(q.try_acquire(600));
        assert!(!q.try_acquire(600));

        // The failed acquire must not leak the RPM token: a small request
        // still fits RPM-wise once TPM refills. Exhaust TPM again to show
        // RPM tokens remain available.
        assert!(!q.try_acquire(600));
        let stats = q.throughput_stats();
        assert_eq!(stats.request_count, 1);
    }

    #[test]
    fn test_rpm_bound() {
        let q = queue(2, 1_000_000);
        assert!(q.try_acquire(10));
        assert!(q.try_acquire(10));
        assert!(!q.try_acquire(10));
        assert!(q.time_until_available(10) > 0.0);
    }

    #[test]
    fn test_reconcile_adjusts_counters() {
        let q = queue(60, 10_000);
        assert!(q.try_acquire(1000));
        q.reconcile(1000, 400);

        let stats = q.throughput_stats();
        assert_eq!(stats.token_count, 400);
    }

    #[test]
    fn test_stats_freeze_on_empty() {
        let q = queue(60, 10_000);
        q.enqueue(prompt("t1", 100));
        assert!(q.try_acquire(100));
        q.dequeue();

        let stats = q.throughput_stats();
        assert!(stats.is_frozen);

        // Next acquire unfreezes
        assert!(q.try_acquire(100));
        assert!(!q.throughput_stats().is_frozen);
    }

    #[test]
    fn test_tpm_shapes_initial_burst() {
        // RPM 60 would admit 60 requests, but TPM 10_000 admits only
        // floor(10_000 / 500) = 20 before the window dries up
        let q = queue(60, 10_000);
        let mut acquired = 0;
        while q.try_acquire(500) {
            acquired += 1;
        }
        assert_eq!(acquired, 20);
        assert!(q.time_until_available(500) > 0.0);
    }

    #[test]
    fn test_stats_empty_queue() {
        let q = queue(60, 10_000);
        let stats = q.throughput_stats();
        assert_eq!(stats.request_count, 0);
        assert!(!stats.is_frozen);
    }
}
