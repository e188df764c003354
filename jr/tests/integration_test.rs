//! End-to-end tests driving jobs through the full pipeline with a
//! scripted model: submit -> decompose -> render -> dispatch -> execute ->
//! propagate -> assemble.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use jobrunner::config::RunnerConfig;
use jobrunner::domain::{JobState, RetryPolicy, TaskStatus};
use jobrunner::llm::{LanguageModel, LlmError, Model, ModelRequest, ModelResponse};
use jobrunner::runner::{Runner, RunnerError};
use jobrunner::service::{JobSpec, SubmitOptions};
use jobrunner::survey::{Agent, Condition, ModelSpec, Question, Rule, Scenario, Survey};
use jobrunner::workers::WorkerRegistry;
use kvstore::MemoryStorage;

/// Scripted model: records every user prompt and answers via a closure.
struct ScriptedModel {
    calls: Mutex<Vec<String>>,
    respond: Box<dyn Fn(&ModelRequest) -> Result<ModelResponse, LlmError> + Send + Sync>,
}

impl ScriptedModel {
    fn new(
        respond: impl Fn(&ModelRequest) -> Result<ModelResponse, LlmError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        })
    }

    fn answering(answer: Value) -> Arc<Self> {
        Self::new(move |_request| {
            Ok(ModelResponse {
                answer: answer.clone(),
                input_tokens: Some(100),
                output_tokens: Some(20),
                ..Default::default()
            })
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn get_response(&self, request: ModelRequest) -> Result<ModelResponse, LlmError> {
        self.calls.lock().unwrap().push(request.user_prompt.clone());
        (self.respond)(&request)
    }
}

fn runner() -> Runner {
    let config = RunnerConfig {
        max_workers: 4,
        idle_timeout_secs: 1,
        ..Default::default()
    };
    Runner::new(Arc::new(MemoryStorage::new()), config)
}

fn test_model(client: Arc<ScriptedModel>) -> Model {
    Model::new(ModelSpec::new("scripted-model", "test"), client)
}

fn linear_survey() -> Survey {
    Survey::new(vec![
        Question::new("q1", "Question one: pick a color."),
        Question::new("q2", "Question two: you picked {{ q1.answer }}, why?"),
        Question::new("q3", "Question three: summarize."),
    ])
    .with_memory("q2", vec!["q1".to_string()])
    .with_memory("q3", vec!["q2".to_string()])
}

// Scenario: linear DAG, single model, one interview
#[tokio::test]
async fn test_linear_dag_executes_in_order() {
    let client = ScriptedModel::answering(json!("blue"));
    let spec = JobSpec::new(linear_survey(), vec![test_model(client.clone())]);

    let run = runner();
    let handle = run.submit(&spec, SubmitOptions::default()).unwrap();

    let progress = handle.progress().unwrap();
    assert_eq!(progress.ready_tasks, 1);
    assert_eq!(progress.pending_tasks, 2);

    let results = handle.results().await.unwrap();

    // Exactly 3 LLM calls, in dependency order
    let calls = client.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[0].contains("Question one"));
    assert!(calls[1].contains("Question two"));
    assert!(calls[1].contains("you picked blue"));
    assert!(calls[2].contains("Question three"));

    // One result carrying all three answers
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.answers["q1"], json!("blue"));
    assert_eq!(result.answers["q2"], json!("blue"));
    assert_eq!(result.answers["q3"], json!("blue"));
    assert_eq!(result.input_tokens, 300);

    assert_eq!(handle.status().unwrap(), JobState::Completed);
    let progress = handle.progress().unwrap();
    assert_eq!(progress.completed_tasks, 3);
    assert_eq!(progress.pending_tasks, 0);
    assert_eq!(progress.running_tasks, 0);
}

// Scenario: cross-product decomposition with iterations
#[tokio::test]
async fn test_cross_product_produces_one_result_per_interview() {
    let client = ScriptedModel::answering(json!("ok"));
    let survey = Survey::new(vec![Question::new("q1", "About {{ topic }}?")]);
    let spec = JobSpec {
        survey,
        scenarios: vec![
            Scenario::new().with("topic", json!("rivers")),
            Scenario::new().with("topic", json!("glaciers")),
        ],
        agents: vec![Agent::new()],
        models: vec![test_model(client.clone())],
    };

    let run = runner();
    let handle = run
        .submit(&spec, SubmitOptions { n: 2, ..Default::default() })
        .unwrap();
    let results = handle.results().await.unwrap();

    // 2 scenarios x 1 agent x 1 model x 2 iterations
    assert_eq!(results.len(), 4);
    assert_eq!(client.call_count(), 4);

    // Interview hashes differ across scenarios and iterations
    let hashes: std::collections::HashSet<&str> = results
        .iter()
        .map(|r| r.interview_hash.as_str())
        .collect();
    assert_eq!(hashes.len(), 4);
}

// Scenario: retry then give up
#[tokio::test]
async fn test_retry_then_give_up() {
    let client = ScriptedModel::new(|_request| {
        Err(LlmError::Provider {
            status: 503,
            body: "overloaded".to_string(),
        })
    });
    let spec = JobSpec::new(linear_survey(), vec![test_model(client.clone())]);

    let mut retry_policies = std::collections::HashMap::new();
    retry_policies.insert("server_error".to_string(), RetryPolicy::new(2, 0.0, true));

    let run = runner();
    let handle = run
        .submit(
            &spec,
            SubmitOptions {
                retry_policies,
                ..Default::default()
            },
        )
        .unwrap();
    let results = handle.results().await.unwrap();

    // Exactly two invocations: the original and one retry
    assert_eq!(client.call_count(), 2);

    // q1 failed; q2 and q3 blocked
    assert_eq!(handle.status().unwrap(), JobState::CompletedWithFailures);
    let progress = handle.progress().unwrap();
    assert_eq!(progress.failed_tasks, 1);
    assert_eq!(progress.blocked_tasks, 2);

    let errors = handle.errors().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].error_kind, "server_error");
    assert_eq!(errors[0].attempts["server_error"], 2);

    // The interview still yields a result, with null answers
    assert_eq!(results.len(), 1);
    assert!(results[0].answers["q1"].is_null());
}

// Scenario: stop_on_exception cancels the job and surfaces the failure
#[tokio::test]
async fn test_stop_on_exception() {
    let client = ScriptedModel::new(|request| {
        if request.user_prompt.contains("poison") {
            Err(LlmError::Provider {
                status: 400,
                body: "bad input".to_string(),
            })
        } else {
            Ok(ModelResponse {
                answer: json!("fine"),
                ..Default::default()
            })
        }
    });
    let survey = Survey::new(vec![
        Question::new("q1", "Start with {{ topic }}."),
        Question::new("q2", "Continue."),
        Question::new("q3", "Finish."),
    ])
    .with_memory("q2", vec!["q1".to_string()])
    .with_memory("q3", vec!["q2".to_string()]);
    let spec = JobSpec {
        survey,
        scenarios: vec![
            Scenario::new().with("topic", json!("poison")),
            Scenario::new().with("topic", json!("water")),
        ],
        agents: vec![],
        models: vec![test_model(client.clone())],
    };

    let run = runner();
    let handle = run
        .submit(
            &spec,
            SubmitOptions {
                stop_on_exception: true,
                ..Default::default()
            },
        )
        .unwrap();

    let err = handle.results().await.unwrap_err();
    match err {
        RunnerError::TaskExecution(e) => {
            assert_eq!(e.error_kind, "invalid_request");
            assert!(!e.task_id.is_empty());
            assert!(!e.interview_id.is_empty());
        }
        other => panic!("expected TaskExecutionError, got {other:?}"),
    }

    assert_eq!(handle.status().unwrap(), JobState::Cancelled);
    let errors = handle.errors().unwrap();
    assert!(!errors.is_empty());
    assert_eq!(errors[0].error_kind, "invalid_request");
}

// Scenario: skip via branching rule
#[tokio::test]
async fn test_skip_via_branching_rule() {
    let client = ScriptedModel::answering(json!("yes"));
    let survey = Survey::new(vec![
        Question::new("q1", "Gate question."),
        Question::new("q2", "Detail question."),
        Question::new("q3", "Final question."),
    ])
    .with_rule(Rule::jump(0, Condition::equals("q1", json!("yes")), 2));
    let spec = JobSpec::new(survey, vec![test_model(client.clone())]);

    let run = runner();
    let handle = run.submit(&spec, SubmitOptions::default()).unwrap();
    let results = handle.results().await.unwrap();

    // q2 was skipped: only q1 and q3 hit the model
    assert_eq!(client.call_count(), 2);

    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.answers["q1"], json!("yes"));
    assert!(result.answers["q2"].is_null());
    assert_eq!(result.answers["q3"], json!("yes"));
    assert_eq!(
        result.comments.get("q2").map(String::as_str),
        Some("Skip rule: jump from 0 to 2")
    );

    // Skips don't count as failures
    assert_eq!(handle.status().unwrap(), JobState::Completed);
    let progress = handle.progress().unwrap();
    assert_eq!(progress.completed_tasks, 2);
    assert_eq!(progress.skipped_tasks, 1);
}

// Direct-answer tasks bypass rendering and queuing entirely
#[tokio::test]
async fn test_functional_question_bypasses_llm() {
    let client = ScriptedModel::answering(json!("llm answer"));
    let survey = Survey::new(vec![
        Question::new("asked", "A real question."),
        Question::new("computed", "unused")
            .with_func(Arc::new(|scenario, _traits| {
                Ok(json!(scenario
                    .get("base")
                    .and_then(Value::as_i64)
                    .unwrap_or(0)
                    + 1))
            })),
    ]);
    let spec = JobSpec {
        survey,
        scenarios: vec![Scenario::new().with("base", json!(41))],
        agents: vec![],
        models: vec![test_model(client.clone())],
    };

    let run = runner();
    let handle = run.submit(&spec, SubmitOptions::default()).unwrap();
    let results = handle.results().await.unwrap();

    // Only the real question reached the model
    assert_eq!(client.call_count(), 1);

    let result = &results[0];
    assert_eq!(result.answers["asked"], json!("llm answer"));
    assert_eq!(result.answers["computed"], json!(42));
    assert_eq!(handle.status().unwrap(), JobState::Completed);
}

// A shared response cache deduplicates identical prompts but not across
// iterations
#[tokio::test]
async fn test_cache_keys_keep_iterations_separate() {
    let client = ScriptedModel::answering(json!("cached?"));
    let survey = Survey::new(vec![Question::new("q1", "Identical prompt.")]);
    let spec = JobSpec::new(survey, vec![test_model(client.clone())]);

    let run = runner();
    let handle = run
        .submit(&spec, SubmitOptions { n: 2, ..Default::default() })
        .unwrap();
    let results = handle.results().await.unwrap();

    // Same prompt both iterations, but iteration is in the cache key, so
    // the second interview misses the cache and calls the model again
    assert_eq!(results.len(), 2);
    assert_eq!(client.call_count(), 2);
}

// Scenario: dead-worker recovery through the worker registry
#[tokio::test]
async fn test_dead_worker_task_requeued() {
    use jobrunner::coordinator::ExecutionCoordinator;
    use jobrunner::render::RenderedPrompt;
    use jobrunner::scheduler::QueueRegistry;

    let storage = Arc::new(MemoryStorage::new());
    let worker_registry = Arc::new(WorkerRegistry::new(storage, Duration::from_millis(100)));

    let queues = Arc::new(QueueRegistry::new(false));
    queues.register_queue("test", "m", "key", None, None);
    let coordinator = Arc::new(
        ExecutionCoordinator::new(queues).with_worker_registry(
            worker_registry.clone(),
            Duration::from_millis(50),
        ),
    );

    // Worker A claims task t1 and heartbeats once
    worker_registry
        .register(Some("worker-a".to_string()), Value::Null, Value::Null)
        .unwrap();
    coordinator
        .enqueue(RenderedPrompt {
            task_id: "t1".to_string(),
            job_id: "j".to_string(),
            interview_id: "i".to_string(),
            system_prompt: String::new(),
            user_prompt: String::new(),
            estimated_tokens: 500,
            cache_key: "ck".to_string(),
            question_name: "q1".to_string(),
            model_id: "m".to_string(),
            model_name: "m".to_string(),
            service_name: "test".to_string(),
            iteration: 0,
            files: None,
        })
        .unwrap();
    let assignment = coordinator.try_assign().unwrap();
    assert_eq!(assignment.task.task_id, "t1");
    worker_registry
        .heartbeat("worker-a", Some("t1"), Some("j"))
        .unwrap();

    // Worker A halts; its heartbeat lapses
    tokio::time::sleep(Duration::from_millis(150)).await;
    let dead_tasks = worker_registry.get_dead_worker_tasks().unwrap();
    assert_eq!(
        dead_tasks,
        vec![("worker-a".to_string(), "j".to_string(), "t1".to_string())]
    );

    // The recovery pass requeues t1 and purges the dead worker
    let recovered = coordinator.check_dead_workers().unwrap();
    assert_eq!(recovered, 1);
    assert!(worker_registry.get_active_workers().unwrap().is_empty());

    // Worker B picks the task up again
    let again = coordinator.try_assign().unwrap();
    assert_eq!(again.task.task_id, "t1");
}

// The whole pipeline also runs against the SQLite backend
#[tokio::test]
async fn test_sqlite_backed_run() {
    use kvstore::SqliteStorage;

    let dir = tempfile::TempDir::new().unwrap();
    let storage = Arc::new(SqliteStorage::open(dir.path().join("jobs.db")).unwrap());

    let client = ScriptedModel::answering(json!("persisted"));
    let spec = JobSpec::new(linear_survey(), vec![test_model(client.clone())]);

    let config = RunnerConfig {
        max_workers: 2,
        idle_timeout_secs: 1,
        ..Default::default()
    };
    let run = Runner::new(storage.clone(), config);
    let handle = run.submit(&spec, SubmitOptions::default()).unwrap();
    let results = handle.results().await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].answers["q1"], json!("persisted"));

    // Answers survive in the durable surface: a fresh service over the
    // same store sees the finished job
    let fresh = jobrunner::service::JobService::new(storage);
    let progress = fresh.get_progress(handle.job_id()).unwrap();
    assert_eq!(progress.completed_tasks, 3);
    assert_eq!(progress.state, JobState::Completed);
}

// Cancellation drops unassigned work
#[tokio::test]
async fn test_cancel_before_results() {
    let client = ScriptedModel::answering(json!("x"));
    let spec = JobSpec::new(linear_survey(), vec![test_model(client.clone())]);

    let run = runner();
    let handle = run.submit(&spec, SubmitOptions::default()).unwrap();
    handle.cancel().unwrap();

    let err = handle.results().await.unwrap_err();
    assert!(matches!(err, RunnerError::Cancelled(_)));
    assert_eq!(handle.status().unwrap(), JobState::Cancelled);
}

// Invariant sweep after a mixed run: ready set matches READY statuses,
// counters are consistent, answers exist for terminal non-failed tasks
#[tokio::test]
async fn test_invariants_after_mixed_outcome_run() {
    let client = ScriptedModel::new(|request| {
        if request.user_prompt.contains("Detail") {
            Err(LlmError::Provider {
                status: 400,
                body: "invalid".to_string(),
            })
        } else {
            Ok(ModelResponse {
                answer: json!("ok"),
                ..Default::default()
            })
        }
    });
    let survey = Survey::new(vec![
        Question::new("q1", "Intro question."),
        Question::new("q2", "Detail question."),
        Question::new("q3", "Depends on detail."),
    ])
    .with_memory("q3", vec!["q2".to_string()]);
    let spec = JobSpec::new(survey, vec![test_model(client.clone())]);

    let run = runner();
    let handle = run.submit(&spec, SubmitOptions::default()).unwrap();
    handle.results().await.unwrap();

    let service = run.service();
    let job_id = handle.job_id();
    let progress = handle.progress().unwrap();

    // Counter arithmetic
    assert_eq!(
        progress.completed_tasks + progress.skipped_tasks + progress.failed_tasks
            + progress.blocked_tasks,
        progress.total_tasks as i64
    );
    assert_eq!(progress.ready_tasks, 0);
    assert_eq!(
        progress.completed_interviews + progress.failed_interviews,
        progress.total_interviews as i64
    );

    // Answers exist iff the task completed or was skipped
    let job_def = service.jobs().get_definition(job_id).unwrap().unwrap();
    for interview_id in &job_def.interview_ids {
        let interview = service
            .interviews()
            .get_definition(job_id, interview_id)
            .unwrap()
            .unwrap();
        let defs = service
            .tasks()
            .get_definitions_batch(job_id, interview_id, &interview.task_ids)
            .unwrap();
        for def in defs.values() {
            let status = service.tasks().get_status(&def.task_id).unwrap();
            let answer = service
                .answers()
                .get(job_id, interview_id, &def.question_name)
                .unwrap();
            match status {
                TaskStatus::Completed | TaskStatus::Skipped => assert!(answer.is_some()),
                _ => assert!(answer.is_none(), "{status} task has an answer"),
            }
        }
    }
}
