//! Job definition and volatile job state

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// Lifecycle of a job as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created but not yet started
    #[default]
    Pending,
    /// Interviews are executing
    Running,
    /// Every interview finished with no failures
    Completed,
    /// Every interview finished, at least one with failures
    CompletedWithFailures,
    /// Cancelled by the caller or by stop-on-exception
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::CompletedWithFailures | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::CompletedWithFailures => "completed_with_failures",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Immutable definition of a submitted job.
///
/// Written once at submit; counters and state live in volatile storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub job_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub total_interviews: usize,
    pub interview_ids: Vec<String>,

    /// Question-name dependency DAG: question -> prerequisite questions
    pub dag: HashMap<String, HashSet<String>>,

    pub scenario_ids: Vec<String>,
    pub agent_ids: Vec<String>,
    pub model_ids: Vec<String>,
    pub question_ids: Vec<String>,

    /// Retry policy table keyed by error kind
    pub retry_policies: HashMap<String, RetryPolicy>,

    /// Iterations per (scenario, agent, model) combination
    pub n_iterations: u32,
}

impl JobDefinition {
    pub fn storage_key(&self) -> String {
        format!("job:{}:meta", self.job_id)
    }
}

/// Volatile interview counters for a job.
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub job_id: String,
    pub completed_interviews: i64,
    pub failed_interviews: i64,
}

impl JobStatus {
    pub fn finished_count(&self) -> i64 {
        self.completed_interviews + self.failed_interviews
    }

    /// A job is done when every interview has been credited.
    pub fn is_done(&self, total_interviews: usize) -> bool {
        self.finished_count() >= total_interviews as i64
    }

    /// Terminal state derived purely from the counters.
    pub fn compute_state(&self, total_interviews: usize) -> JobState {
        if !self.is_done(total_interviews) {
            JobState::Running
        } else if self.failed_interviews > 0 {
            JobState::CompletedWithFailures
        } else {
            JobState::Completed
        }
    }
}
