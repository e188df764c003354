//! Interview definition and volatile interview state

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle of one interview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterviewState {
    #[default]
    Running,
    Completed,
    CompletedWithFailures,
}

impl InterviewState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, InterviewState::Running)
    }
}

impl std::fmt::Display for InterviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterviewState::Running => "running",
            InterviewState::Completed => "completed",
            InterviewState::CompletedWithFailures => "completed_with_failures",
        };
        write!(f, "{s}")
    }
}

/// Immutable definition of one (scenario, agent, model, iteration)
/// combination within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterviewDefinition {
    pub interview_id: String,
    pub job_id: String,
    pub scenario_id: String,
    pub agent_id: String,
    pub model_id: String,

    /// Iteration index, 0..n-1
    pub iteration: u32,

    pub total_tasks: usize,
    pub task_ids: Vec<String>,

    /// Randomized option order per question, when the survey asked for it.
    /// question_name -> permuted options list
    #[serde(default)]
    pub question_option_permutations: HashMap<String, Vec<Value>>,
}

impl InterviewDefinition {
    pub fn storage_key(&self) -> String {
        format!("job:{}:interview:{}", self.job_id, self.interview_id)
    }
}

/// Volatile task counters for an interview.
///
/// The interview state is a pure function of these counters against
/// `total_tasks`.
#[derive(Debug, Clone, Default)]
pub struct InterviewStatus {
    pub interview_id: String,
    pub completed: i64,
    pub skipped: i64,
    pub failed: i64,
    pub blocked: i64,
}

impl InterviewStatus {
    pub fn terminal_count(&self) -> i64 {
        self.completed + self.skipped + self.failed + self.blocked
    }

    pub fn is_done(&self, total_tasks: usize) -> bool {
        self.terminal_count() >= total_tasks as i64
    }

    pub fn compute_state(&self, total_tasks: usize) -> InterviewState {
        if !self.is_done(total_tasks) {
            InterviewState::Running
        } else if self.failed > 0 || self.blocked > 0 {
            InterviewState::CompletedWithFailures
        } else {
            InterviewState::Completed
        }
    }
}
