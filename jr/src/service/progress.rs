//! Progress snapshots and error surfacing

use std::collections::HashMap;

use serde::Serialize;

use super::{JobService, ServiceError};
use crate::domain::{JobState, TaskStatus};

/// Aggregate progress for a job; all counts come from batch reads.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub job_id: String,
    pub state: JobState,

    pub total_interviews: usize,
    pub completed_interviews: i64,
    pub failed_interviews: i64,
    pub running_interviews: i64,

    pub total_tasks: usize,
    pub completed_tasks: i64,
    pub skipped_tasks: i64,
    pub failed_tasks: i64,
    pub blocked_tasks: i64,
    pub pending_tasks: i64,
    pub ready_tasks: i64,
    pub running_tasks: i64,
}

/// One record per permanently failed task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskErrorDetail {
    pub task_id: String,
    pub interview_id: String,
    pub question_name: Option<String>,
    pub model_id: Option<String>,
    pub error_kind: String,
    pub error_message: String,
    pub attempts: HashMap<String, u32>,
}

/// The first failed task found, for stop-on-exception surfacing.
#[derive(Debug, Clone)]
pub struct FailedTaskInfo {
    pub task_id: String,
    pub interview_id: String,
    pub error_kind: String,
    pub error_message: String,
}

impl JobService {
    /// Snapshot progress for a job.
    pub fn get_progress(&self, job_id: &str) -> Result<Progress, ServiceError> {
        let Some(job_def) = self.jobs().get_definition(job_id)? else {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        };
        let job_status = self.jobs().get_status(job_id)?;
        let state = self.jobs().get_state(job_id)?;

        let interview_defs = self
            .interviews()
            .get_definitions_batch(job_id, &job_def.interview_ids)?;
        let interview_statuses = self
            .interviews()
            .get_statuses_batch(&job_def.interview_ids)?;

        let mut total_tasks = 0usize;
        let mut completed = 0i64;
        let mut skipped = 0i64;
        let mut failed = 0i64;
        let mut blocked = 0i64;
        let mut all_task_ids = Vec::new();

        for interview_id in &job_def.interview_ids {
            if let Some(def) = interview_defs.get(interview_id) {
                total_tasks += def.total_tasks;
                all_task_ids.extend(def.task_ids.iter().cloned());
            }
            if let Some(status) = interview_statuses.get(interview_id) {
                completed += status.completed;
                skipped += status.skipped;
                failed += status.failed;
                blocked += status.blocked;
            }
        }

        let ready_tasks = self.tasks().get_ready_count(job_id)? as i64;

        // Tasks in the pipeline: rendering, queued, or executing
        let task_statuses = self.tasks().get_statuses_batch(&all_task_ids)?;
        let running_tasks = task_statuses
            .values()
            .filter(|s| {
                matches!(
                    s,
                    TaskStatus::Running | TaskStatus::Rendering | TaskStatus::Queued
                )
            })
            .count() as i64;

        let accounted = completed + skipped + failed + blocked;
        let remaining = total_tasks as i64 - accounted;
        let pending_tasks = (remaining - ready_tasks - running_tasks).max(0);

        Ok(Progress {
            job_id: job_id.to_string(),
            state,
            total_interviews: job_def.total_interviews,
            completed_interviews: job_status.completed_interviews,
            failed_interviews: job_status.failed_interviews,
            running_interviews: job_def.total_interviews as i64 - job_status.finished_count(),
            total_tasks,
            completed_tasks: completed,
            skipped_tasks: skipped,
            failed_tasks: failed,
            blocked_tasks: blocked,
            pending_tasks,
            ready_tasks,
            running_tasks,
        })
    }

    /// All permanently failed tasks with their last errors and attempt
    /// counts.
    pub fn get_error_details(&self, job_id: &str) -> Result<Vec<TaskErrorDetail>, ServiceError> {
        let Some(job_def) = self.jobs().get_definition(job_id)? else {
            return Ok(Vec::new());
        };

        let interview_defs = self
            .interviews()
            .get_definitions_batch(job_id, &job_def.interview_ids)?;

        let mut errors = Vec::new();
        for interview_id in &job_def.interview_ids {
            let Some(interview_def) = interview_defs.get(interview_id) else {
                continue;
            };
            let statuses = self.tasks().get_statuses_batch(&interview_def.task_ids)?;
            let failed_ids: Vec<&String> = interview_def
                .task_ids
                .iter()
                .filter(|tid| statuses.get(*tid) == Some(&TaskStatus::Failed))
                .collect();
            if failed_ids.is_empty() {
                continue;
            }

            let task_defs = self.tasks().get_definitions_batch(
                job_id,
                interview_id,
                &failed_ids.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )?;

            for task_id in failed_ids {
                let state = self.tasks().get_state(task_id)?;
                let def = task_defs.get(task_id);
                errors.push(TaskErrorDetail {
                    task_id: task_id.clone(),
                    interview_id: interview_id.clone(),
                    question_name: def.map(|d| d.question_name.clone()),
                    model_id: def.map(|d| d.model_id.clone()),
                    error_kind: state.last_error_kind.unwrap_or_else(|| "unknown".to_string()),
                    error_message: state
                        .last_error_message
                        .unwrap_or_else(|| "Unknown error".to_string()),
                    attempts: state.attempts,
                });
            }
        }
        Ok(errors)
    }

    /// Error counts by kind.
    pub fn get_error_counts(&self, job_id: &str) -> Result<HashMap<String, usize>, ServiceError> {
        let mut counts = HashMap::new();
        for error in self.get_error_details(job_id)? {
            *counts.entry(error.error_kind).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// First failed task found, if any.
    pub fn get_first_failed_task(
        &self,
        job_id: &str,
    ) -> Result<Option<FailedTaskInfo>, ServiceError> {
        Ok(self
            .get_error_details(job_id)?
            .into_iter()
            .next()
            .map(|e| FailedTaskInfo {
                task_id: e.task_id,
                interview_id: e.interview_id,
                error_kind: e.error_kind,
                error_message: e.error_message,
            }))
    }
}
