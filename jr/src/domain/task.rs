//! Task definition, status machine, and volatile task state

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a task is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    /// Rendered into prompts and dispatched through the queue pipeline
    #[default]
    Llm,
    /// Answered by the agent's direct-answer callable, client-side
    AgentDirect,
    /// Answered by the question's own function, client-side
    Functional,
}

/// The nine-state task machine.
///
/// ```text
/// PENDING -> READY -> RENDERING -> QUEUED -> RUNNING -> COMPLETED
///                                               |-> READY (retryable failure)
///                                               '-> FAILED (terminal failure)
/// PENDING/READY/QUEUED/RUNNING -> SKIPPED  (skip rule applies)
/// any non-terminal -> BLOCKED             (upstream failure)
/// ```
///
/// COMPLETED and SKIPPED satisfy downstream dependencies; FAILED and
/// BLOCKED propagate blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Ready,
    Rendering,
    Queued,
    Running,
    Completed,
    Skipped,
    Failed,
    Blocked,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Skipped | TaskStatus::Failed | TaskStatus::Blocked
        )
    }

    /// Only these terminal states satisfy downstream dependencies.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Rendering => "rendering",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failed => "failed",
            TaskStatus::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

/// Immutable definition of one question within an interview.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub task_id: String,
    pub job_id: String,
    pub interview_id: String,
    pub scenario_id: String,
    pub agent_id: String,
    pub model_id: String,
    pub question_id: String,
    pub question_name: String,
    pub iteration: u32,

    /// Prerequisite task ids, all within the same interview
    pub depends_on: Vec<String>,

    /// Reverse edges: tasks that depend on this one
    pub dependents: Vec<String>,

    #[serde(default)]
    pub execution_type: ExecutionType,
}

impl TaskDefinition {
    pub fn storage_key(&self) -> String {
        format!(
            "job:{}:interview:{}:task:{}",
            self.job_id, self.interview_id, self.task_id
        )
    }

    /// Initial status: tasks with no prerequisites start READY.
    pub fn initial_status(&self) -> TaskStatus {
        if self.depends_on.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        }
    }
}

/// Volatile task state.
#[derive(Debug, Clone, Default)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    pub unmet_deps: i64,
    /// error_kind -> attempt count
    pub attempts: HashMap<String, u32>,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub next_retry: Option<DateTime<Utc>>,
}
