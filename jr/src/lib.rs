//! JobRunner - distributed job-execution engine for large batches of LLM
//! calls
//!
//! A caller submits a **job**: a survey of interdependent questions to be
//! answered across the cross-product of (scenarios x agents x models x
//! iterations). The engine decomposes the job into interviews and tasks,
//! schedules tasks honoring per-question dependency DAGs and per-provider
//! rate limits, executes them against remote LLM APIs via a worker pool,
//! reconciles token estimates against actual usage, retries classified
//! failures, skips tasks excluded by branching rules, recovers work from
//! dead workers, and assembles typed results from persisted answers.
//!
//! # Modules
//!
//! - [`domain`] - jobs, interviews, tasks, answers, retry policies
//! - [`survey`] - questions, scenarios, agents, models, branching rules
//! - [`stores`] - typed accessors over the storage protocol
//! - [`scheduler`] - token buckets, queues, the dispatch heap, routing
//! - [`coordinator`] - work assignment, in-flight tracking, recovery
//! - [`render`] - prompt rendering pipeline
//! - [`workers`] - execution workers, pool, registry, heartbeats
//! - [`service`] - the job orchestrator
//! - [`runner`] - top-level control surface
//! - [`llm`] - model client trait and Anthropic implementation
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod llm;
pub mod render;
pub mod runner;
pub mod scheduler;
pub mod service;
pub mod stores;
pub mod survey;
pub mod workers;

// Re-export commonly used types
pub use config::{Config, LlmConfig, RunnerConfig, StorageConfig};
pub use coordinator::{CoordinatorStats, ExecutionCoordinator, WorkAssignment, WorkCompletion};
pub use domain::{
    Answer, ExecutionType, InterviewDefinition, InterviewState, InterviewStatus, JobDefinition,
    JobState, JobStatus, RetryPolicy, TaskDefinition, TaskState, TaskStatus, generate_id,
};
pub use llm::{
    AnthropicModel, ErrorKind, FileRef, LanguageModel, LlmError, Model, ModelRequest,
    ModelResponse, ResponseCache,
};
pub use render::{
    HandlebarsRenderer, PromptRenderer, RenderWorker, RenderedParts, RenderedPrompt,
};
pub use runner::{
    DirectAnswerRegistry, JobHandle, Runner, RunnerError, TaskExecutionError,
};
pub use scheduler::{DispatchHeap, Queue, QueueMeta, QueueRegistry, ThroughputStats, TokenBucket};
pub use service::{
    InterviewResult, JobService, JobSpec, Progress, ServiceError, SubmitOptions, TaskCompletion,
    TaskErrorDetail,
};
pub use survey::{
    Agent, CmpOp, Condition, ModelSpec, NextQuestion, Question, Rule, RuleCollection, Scenario,
    Survey,
};
pub use workers::{
    ExecutionWorker, ExecutionWorkerPool, HeartbeatManager, WorkerInfo, WorkerRegistry,
};
