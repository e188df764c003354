//! Completion propagation: the heart of the task state machine

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{JobService, ServiceError};
use crate::domain::{Answer, InterviewState, RetryPolicy, TaskStatus};

/// Everything a finished task reports for its answer record.
#[derive(Debug, Clone, Default)]
pub struct TaskCompletion {
    pub answer_value: Value,
    pub comment: Option<String>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub raw_model_response: Option<Value>,
    pub generated_tokens: Option<String>,
    pub cached: bool,
    pub system_prompt: Option<String>,
    pub user_prompt: Option<String>,
    pub input_price_per_million_tokens: Option<f64>,
    pub output_price_per_million_tokens: Option<f64>,
    pub cache_key: Option<String>,
    pub validated: Option<bool>,
    pub reasoning_summary: Option<String>,
}

impl TaskCompletion {
    pub fn from_value(answer_value: Value) -> Self {
        Self {
            answer_value,
            ..Default::default()
        }
    }
}

impl JobService {
    /// A task finished successfully: write the answer (idempotently, by
    /// key), mark COMPLETED, satisfy dependents, and roll the interview
    /// and job state forward.
    pub fn on_task_completed(
        &self,
        job_id: &str,
        interview_id: &str,
        task_id: &str,
        completion: TaskCompletion,
    ) -> Result<(), ServiceError> {
        let Some(task_def) = self.tasks().get_definition(job_id, interview_id, task_id)? else {
            return Err(ServiceError::TaskNotFound(task_id.to_string()));
        };

        // Replay guard: a terminal task must not touch counters again
        if self.tasks().get_status(task_id)?.is_terminal() {
            debug!(task_id, "Completion replay on terminal task ignored");
            return Ok(());
        }

        let answer = Answer {
            job_id: job_id.to_string(),
            interview_id: interview_id.to_string(),
            question_name: task_def.question_name.clone(),
            answer: completion.answer_value,
            created_at: Utc::now(),
            comment: completion.comment,
            system_prompt: completion.system_prompt,
            user_prompt: completion.user_prompt,
            cached: completion.cached,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            raw_model_response: completion.raw_model_response,
            generated_tokens: completion.generated_tokens,
            model_id: Some(task_def.model_id.clone()),
            input_price_per_million_tokens: completion.input_price_per_million_tokens,
            output_price_per_million_tokens: completion.output_price_per_million_tokens,
            cache_key: completion.cache_key,
            validated: completion.validated,
            reasoning_summary: completion.reasoning_summary,
        };
        self.answers().store(&answer)?;

        self.tasks().set_status(task_id, TaskStatus::Completed)?;
        debug!(task_id, question = %task_def.question_name, "Task completed");

        for dependent_id in &task_def.dependents {
            if self.tasks().mark_dependency_satisfied(job_id, dependent_id)? {
                debug!(task_id = %dependent_id, "Dependent became ready");
            }
        }

        self.interviews().mark_task_completed(job_id, interview_id)?;
        self.finalize_interview_if_done(job_id, interview_id)
    }

    /// A task was skipped: it still satisfies dependents, and a
    /// null-valued answer is written so results assembly sees one entry
    /// per question.
    pub fn on_task_skipped(
        &self,
        job_id: &str,
        interview_id: &str,
        task_id: &str,
        skip_reason: Option<&str>,
    ) -> Result<(), ServiceError> {
        let Some(task_def) = self.tasks().get_definition(job_id, interview_id, task_id)? else {
            return Err(ServiceError::TaskNotFound(task_id.to_string()));
        };

        if self.tasks().get_status(task_id)?.is_terminal() {
            debug!(task_id, "Skip replay on terminal task ignored");
            return Ok(());
        }

        let mut answer = Answer::new(job_id, interview_id, &task_def.question_name, Value::Null);
        answer.comment = skip_reason.map(String::from);
        answer.model_id = Some(task_def.model_id.clone());
        self.answers().store(&answer)?;

        self.tasks().set_status(task_id, TaskStatus::Skipped)?;
        info!(
            task_id,
            question = %task_def.question_name,
            reason = skip_reason.unwrap_or("unspecified"),
            "Task skipped"
        );

        // Skipped tasks still satisfy downstream dependencies
        for dependent_id in &task_def.dependents {
            self.tasks().mark_dependency_satisfied(job_id, dependent_id)?;
        }

        self.interviews().mark_task_skipped(job_id, interview_id)?;
        self.finalize_interview_if_done(job_id, interview_id)
    }

    /// A task failed. Retryable failures under the policy's attempt limit
    /// return the task to READY; anything else marks it FAILED and blocks
    /// the transitive dependents.
    pub fn on_task_failed(
        &self,
        job_id: &str,
        interview_id: &str,
        task_id: &str,
        error_kind: &str,
        error_message: &str,
    ) -> Result<(), ServiceError> {
        let Some(task_def) = self.tasks().get_definition(job_id, interview_id, task_id)? else {
            return Err(ServiceError::TaskNotFound(task_id.to_string()));
        };

        // Replaying a failure on an already-terminal task is a no-op
        if self.tasks().get_status(task_id)?.is_terminal() {
            debug!(task_id, "Failure replay on terminal task ignored");
            return Ok(());
        }

        // Retry unless the job wants to stop on the first exception
        if !self.stop_on_exception(job_id) {
            let policy = self
                .jobs()
                .get_definition(job_id)?
                .and_then(|job_def| job_def.retry_policies.get(error_kind).copied())
                .unwrap_or_default();

            if policy.retryable {
                let attempt_count = self.tasks().increment_attempt(task_id, error_kind)?;
                if attempt_count < policy.max_attempts {
                    warn!(
                        task_id,
                        error_kind,
                        attempt = attempt_count,
                        max_attempts = policy.max_attempts,
                        "Task failed, retrying"
                    );
                    self.schedule_retry(task_id, &policy, attempt_count)?;
                    self.tasks().set_status(task_id, TaskStatus::Ready)?;
                    self.tasks().add_to_ready(job_id, task_id)?;
                    return Ok(());
                }
            }
        }

        // Permanent failure
        self.tasks().set_status(task_id, TaskStatus::Failed)?;
        self.tasks().set_error(task_id, error_kind, error_message)?;
        warn!(task_id, error_kind, error_message, "Task failed permanently");

        self.propagate_failure(job_id, interview_id, &task_def.dependents)?;

        self.interviews().mark_task_failed(job_id, interview_id)?;
        self.finalize_interview_if_done(job_id, interview_id)
    }

    fn schedule_retry(
        &self,
        task_id: &str,
        policy: &RetryPolicy,
        attempt_count: u32,
    ) -> Result<(), ServiceError> {
        let delay_ms = (policy.base_delay_seconds * attempt_count as f64 * 1000.0) as i64;
        self.tasks()
            .set_next_retry(task_id, Utc::now() + ChronoDuration::milliseconds(delay_ms))?;
        Ok(())
    }

    /// Mark the transitive dependents BLOCKED, crediting each to the
    /// interview's blocked counter.
    fn propagate_failure(
        &self,
        job_id: &str,
        interview_id: &str,
        dependent_ids: &[String],
    ) -> Result<(), ServiceError> {
        for dependent_id in dependent_ids {
            // A dependent reached through two failed parents blocks once
            if self.tasks().get_status(dependent_id)?.is_terminal() {
                continue;
            }
            self.tasks().set_status(dependent_id, TaskStatus::Blocked)?;
            self.tasks().set_error(
                dependent_id,
                "upstream_failure",
                "Blocked by failed dependency",
            )?;
            self.interviews().mark_task_blocked(job_id, interview_id)?;

            if let Some(dep_def) = self
                .tasks()
                .get_definition(job_id, interview_id, dependent_id)?
            {
                self.propagate_failure(job_id, interview_id, &dep_def.dependents)?;
            }
        }
        Ok(())
    }

    /// If the interview reached a terminal state, credit it to the job.
    fn finalize_interview_if_done(
        &self,
        job_id: &str,
        interview_id: &str,
    ) -> Result<(), ServiceError> {
        let state = self.interviews().get_state(interview_id)?;
        if state != InterviewState::Running {
            let had_failures = state == InterviewState::CompletedWithFailures;
            self.jobs()
                .mark_interview_completed(job_id, interview_id, had_failures)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobState, RetryPolicy};
    use crate::llm::Model;
    use crate::service::{JobSpec, SubmitOptions};
    use crate::survey::{ModelSpec, Question, Survey};
    use async_trait::async_trait;
    use kvstore::MemoryStorage;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct NullModel;

    #[async_trait]
    impl crate::llm::LanguageModel for NullModel {
        async fn get_response(
            &self,
            _request: crate::llm::ModelRequest,
        ) -> Result<crate::llm::ModelResponse, crate::llm::LlmError> {
            Ok(crate::llm::ModelResponse::default())
        }
    }

    struct Fixture {
        service: JobService,
        job_id: String,
        interview_id: String,
        /// question_name -> task_id
        tasks: HashMap<String, String>,
    }

    fn submit(survey: Survey, options: SubmitOptions) -> Fixture {
        let service = JobService::new(Arc::new(MemoryStorage::new()));
        let spec = JobSpec::new(
            survey,
            vec![Model::new(ModelSpec::new("test-model", "test"), Arc::new(NullModel))],
        );
        let submitted = service.submit_job(&spec, options).unwrap();
        let job_def = service.jobs().get_definition(&submitted.job_id).unwrap().unwrap();
        let interview_id = job_def.interview_ids[0].clone();
        let interview = service
            .interviews()
            .get_definition(&submitted.job_id, &interview_id)
            .unwrap()
            .unwrap();
        let defs = service
            .tasks()
            .get_definitions_batch(&submitted.job_id, &interview_id, &interview.task_ids)
            .unwrap();
        let tasks = defs
            .values()
            .map(|d| (d.question_name.clone(), d.task_id.clone()))
            .collect();
        Fixture {
            service,
            job_id: submitted.job_id,
            interview_id,
            tasks,
        }
    }

    fn linear_survey() -> Survey {
        Survey::new(vec![
            Question::new("q1", "One?"),
            Question::new("q2", "Two?"),
            Question::new("q3", "Three?"),
        ])
        .with_memory("q2", vec!["q1".to_string()])
        .with_memory("q3", vec!["q2".to_string()])
    }

    #[test]
    fn test_completion_unlocks_dependent() {
        let f = submit(linear_survey(), SubmitOptions::default());
        let t1 = &f.tasks["q1"];
        let t2 = &f.tasks["q2"];

        assert_eq!(f.service.tasks().get_status(t2).unwrap(), TaskStatus::Pending);

        f.service
            .on_task_completed(
                &f.job_id,
                &f.interview_id,
                t1,
                TaskCompletion::from_value(json!("done")),
            )
            .unwrap();

        assert_eq!(f.service.tasks().get_status(t1).unwrap(), TaskStatus::Completed);
        assert_eq!(f.service.tasks().get_status(t2).unwrap(), TaskStatus::Ready);
        assert_eq!(f.service.tasks().get_ready_count(&f.job_id).unwrap(), 1);

        let answer = f.service.answers().get(&f.job_id, &f.interview_id, "q1").unwrap().unwrap();
        assert_eq!(answer.answer, json!("done"));
        assert_eq!(answer.model_id.as_deref(), f.service.jobs()
            .get_definition(&f.job_id).unwrap().unwrap().model_ids.first().map(|s| s.as_str()));
    }

    #[test]
    fn test_full_chain_finalizes_interview_and_job() {
        let f = submit(linear_survey(), SubmitOptions::default());
        for name in ["q1", "q2", "q3"] {
            f.service
                .on_task_completed(
                    &f.job_id,
                    &f.interview_id,
                    &f.tasks[name],
                    TaskCompletion::from_value(json!(name)),
                )
                .unwrap();
        }

        assert_eq!(
            f.service.interviews().get_state(&f.interview_id).unwrap(),
            InterviewState::Completed
        );
        assert_eq!(f.service.jobs().get_state(&f.job_id).unwrap(), JobState::Completed);
    }

    #[test]
    fn test_completion_replay_is_noop() {
        let f = submit(linear_survey(), SubmitOptions::default());
        let t1 = &f.tasks["q1"];

        for _ in 0..2 {
            f.service
                .on_task_completed(
                    &f.job_id,
                    &f.interview_id,
                    t1,
                    TaskCompletion::from_value(json!("x")),
                )
                .unwrap();
        }

        let status = f.service.interviews().get_status(&f.interview_id).unwrap();
        assert_eq!(status.completed, 1);
        // q2 was satisfied exactly once
        let state = f.service.tasks().get_state(&f.tasks["q2"]).unwrap();
        assert_eq!(state.unmet_deps, 0);
        assert_eq!(state.status, TaskStatus::Ready);
    }

    #[test]
    fn test_skip_satisfies_dependents_with_null_answer() {
        let f = submit(linear_survey(), SubmitOptions::default());
        f.service
            .on_task_skipped(&f.job_id, &f.interview_id, &f.tasks["q1"], Some("test skip"))
            .unwrap();

        assert_eq!(
            f.service.tasks().get_status(&f.tasks["q1"]).unwrap(),
            TaskStatus::Skipped
        );
        assert_eq!(
            f.service.tasks().get_status(&f.tasks["q2"]).unwrap(),
            TaskStatus::Ready
        );

        let answer = f.service.answers().get(&f.job_id, &f.interview_id, "q1").unwrap().unwrap();
        assert!(answer.answer.is_null());
        assert_eq!(answer.comment.as_deref(), Some("test skip"));
    }

    #[test]
    fn test_retry_then_permanent_failure() {
        let mut retry_policies = HashMap::new();
        retry_policies.insert("server_error".to_string(), RetryPolicy::new(2, 0.0, true));
        let f = submit(
            linear_survey(),
            SubmitOptions {
                retry_policies,
                ..Default::default()
            },
        );
        let t1 = &f.tasks["q1"];

        // First failure: back to READY, attempts = 1
        f.service
            .on_task_failed(&f.job_id, &f.interview_id, t1, "server_error", "boom")
            .unwrap();
        assert_eq!(f.service.tasks().get_status(t1).unwrap(), TaskStatus::Ready);
        let state = f.service.tasks().get_state(t1).unwrap();
        assert_eq!(state.attempts["server_error"], 1);
        assert!(state.next_retry.is_some());

        // Second failure: attempts reach max, task FAILED, dependents BLOCKED
        f.service
            .on_task_failed(&f.job_id, &f.interview_id, t1, "server_error", "boom again")
            .unwrap();
        assert_eq!(f.service.tasks().get_status(t1).unwrap(), TaskStatus::Failed);
        assert_eq!(
            f.service.tasks().get_status(&f.tasks["q2"]).unwrap(),
            TaskStatus::Blocked
        );
        assert_eq!(
            f.service.tasks().get_status(&f.tasks["q3"]).unwrap(),
            TaskStatus::Blocked
        );

        // The interview is terminal with failures; the job follows
        assert_eq!(
            f.service.interviews().get_state(&f.interview_id).unwrap(),
            InterviewState::CompletedWithFailures
        );
        assert_eq!(
            f.service.jobs().get_state(&f.job_id).unwrap(),
            JobState::CompletedWithFailures
        );

        let state = f.service.tasks().get_state(&f.tasks["q2"]).unwrap();
        assert_eq!(state.last_error_kind.as_deref(), Some("upstream_failure"));
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let f = submit(linear_survey(), SubmitOptions::default());
        let t1 = &f.tasks["q1"];

        f.service
            .on_task_failed(&f.job_id, &f.interview_id, t1, "invalid_request", "bad")
            .unwrap();
        assert_eq!(f.service.tasks().get_status(t1).unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn test_stop_on_exception_skips_retries() {
        let f = submit(
            linear_survey(),
            SubmitOptions {
                stop_on_exception: true,
                ..Default::default()
            },
        );
        let t1 = &f.tasks["q1"];

        // server_error is normally retryable; stop_on_exception short-circuits
        f.service
            .on_task_failed(&f.job_id, &f.interview_id, t1, "server_error", "boom")
            .unwrap();
        assert_eq!(f.service.tasks().get_status(t1).unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn test_failure_replay_is_noop_on_counters() {
        let f = submit(linear_survey(), SubmitOptions::default());
        let t1 = &f.tasks["q1"];

        f.service
            .on_task_failed(&f.job_id, &f.interview_id, t1, "invalid_request", "bad")
            .unwrap();
        let before = f.service.interviews().get_status(&f.interview_id).unwrap();

        f.service
            .on_task_failed(&f.job_id, &f.interview_id, t1, "invalid_request", "bad")
            .unwrap();
        let after = f.service.interviews().get_status(&f.interview_id).unwrap();

        assert_eq!(before.failed, after.failed);
        assert_eq!(before.blocked, after.blocked);
    }

    #[test]
    fn test_diamond_blocks_once() {
        // q1 -> q2, q1 -> q3, q2 -> q4, q3 -> q4
        let survey = Survey::new(vec![
            Question::new("q1", "?"),
            Question::new("q2", "?"),
            Question::new("q3", "?"),
            Question::new("q4", "?"),
        ])
        .with_memory("q2", vec!["q1".to_string()])
        .with_memory("q3", vec!["q1".to_string()])
        .with_memory("q4", vec!["q2".to_string(), "q3".to_string()]);

        let f = submit(survey, SubmitOptions::default());
        f.service
            .on_task_failed(&f.job_id, &f.interview_id, &f.tasks["q1"], "invalid_request", "x")
            .unwrap();

        // q2, q3, q4 all blocked; q4 only once despite two blocked parents
        let status = f.service.interviews().get_status(&f.interview_id).unwrap();
        assert_eq!(status.failed, 1);
        assert_eq!(status.blocked, 3);
        assert_eq!(status.terminal_count(), 4);
    }
}
