//! Retry policies keyed by error kind

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How failures of one error kind are retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed before the task is marked failed
    pub max_attempts: u32,

    /// Base delay before a retry is eligible
    pub base_delay_seconds: f64,

    /// Whether this error kind is retried at all
    pub retryable: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_seconds: f64, retryable: bool) -> Self {
        Self {
            max_attempts,
            base_delay_seconds,
            retryable,
        }
    }
}

impl Default for RetryPolicy {
    /// Fallback for error kinds without an explicit entry.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_seconds: 0.5,
            retryable: true,
        }
    }
}

/// Shipped policy table. Jobs may override entries at submit time.
pub fn default_retry_policies() -> HashMap<String, RetryPolicy> {
    let mut policies = HashMap::new();
    policies.insert("network_timeout".to_string(), RetryPolicy::new(3, 1.0, true));
    policies.insert("rate_limit".to_string(), RetryPolicy::new(5, 2.0, true));
    policies.insert("server_error".to_string(), RetryPolicy::new(3, 0.5, true));
    policies.insert("invalid_request".to_string(), RetryPolicy::new(1, 0.0, false));
    policies.insert("content_policy".to_string(), RetryPolicy::new(1, 0.0, false));
    policies.insert("no_queue".to_string(), RetryPolicy::new(1, 0.0, false));
    policies.insert("direct_answer_error".to_string(), RetryPolicy::new(1, 0.0, false));
    policies.insert("upstream_failure".to_string(), RetryPolicy::new(1, 0.0, false));
    policies.insert("unknown".to_string(), RetryPolicy::new(3, 0.5, true));
    policies
}
