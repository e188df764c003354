//! Job submission and decomposition

use std::collections::{HashMap, HashSet};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use kvstore::Storage;
use rand::seq::SliceRandom;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{JobService, ServiceError};
use crate::domain::{
    ExecutionType, InterviewDefinition, JobDefinition, RetryPolicy, TaskDefinition, generate_id,
    default_retry_policies,
};
use crate::llm::Model;
use crate::survey::{Agent, Question, Scenario, Survey, extract_dag, validate_acyclic};

/// Everything a caller submits: the survey and the cross-product axes.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub survey: Survey,
    pub scenarios: Vec<Scenario>,
    pub agents: Vec<Agent>,
    pub models: Vec<Model>,
}

impl JobSpec {
    pub fn new(survey: Survey, models: Vec<Model>) -> Self {
        Self {
            survey,
            scenarios: Vec::new(),
            agents: Vec::new(),
            models,
        }
    }
}

/// Submission options.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub user_id: String,
    /// Iterations per (scenario, agent, model) combination
    pub n: u32,
    /// Overrides merged over the shipped retry-policy table
    pub retry_policies: HashMap<String, RetryPolicy>,
    pub stop_on_exception: bool,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            n: 1,
            retry_policies: HashMap::new(),
            stop_on_exception: false,
        }
    }
}

/// A task that bypasses the LLM pipeline, with the client-side objects
/// needed to answer it directly.
#[derive(Debug, Clone)]
pub struct DirectTaskEntry {
    pub task_id: String,
    pub interview_id: String,
    pub execution_type: ExecutionType,
    pub agent: Agent,
    pub question: Question,
    pub scenario: Scenario,
}

/// Result of a submission.
#[derive(Debug)]
pub struct SubmittedJob {
    pub job_id: String,
    pub total_interviews: usize,
    pub total_tasks: usize,
    /// Entries for the caller's direct-answer registry
    pub direct_tasks: Vec<DirectTaskEntry>,
}

/// Detect how a task executes: functional questions answer themselves,
/// direct-answering agents skip the LLM, everything else renders.
pub fn detect_execution_type(agent: &Agent, question: &Question) -> ExecutionType {
    if question.func.is_some() {
        ExecutionType::Functional
    } else if agent.direct_answerer.is_some() {
        ExecutionType::AgentDirect
    } else {
        ExecutionType::Llm
    }
}

impl JobService {
    /// Submit a job: validate the survey DAG, persist shared resources,
    /// enumerate interviews as the cross-product x iterations, and create
    /// tasks with projected dependencies. Roots land in the ready set.
    ///
    /// All writes use batch variants; a submit costs O(1) storage round
    /// trips per category regardless of interview and task counts (task
    /// definition writes are chunked at 1000).
    pub fn submit_job(
        &self,
        spec: &JobSpec,
        options: SubmitOptions,
    ) -> Result<SubmittedJob, ServiceError> {
        if spec.models.is_empty() {
            return Err(ServiceError::InvalidJob(
                "a job needs at least one model".to_string(),
            ));
        }

        let job_id = generate_id();
        self.set_stop_on_exception(&job_id, options.stop_on_exception);

        // Fill in defaults so the cross-product is never empty
        let scenarios: Vec<Scenario> = if spec.scenarios.is_empty() {
            vec![Scenario::new()]
        } else {
            spec.scenarios.clone()
        };
        let agents: Vec<Agent> = if spec.agents.is_empty() {
            vec![Agent::new()]
        } else {
            spec.agents.clone()
        };
        let n_iterations = options.n.max(1);

        // Extract and validate the question-name DAG
        let dag = extract_dag(&spec.survey);
        validate_acyclic(&dag).map_err(ServiceError::CyclicSurvey)?;

        // Assign stable ids
        let scenario_ids: Vec<String> = scenarios.iter().map(|_| generate_id()).collect();
        let agent_ids: Vec<String> = agents.iter().map(|_| generate_id()).collect();
        let model_ids: Vec<String> = spec.models.iter().map(|_| generate_id()).collect();
        let question_ids: Vec<String> = spec.survey.questions.iter().map(|_| generate_id()).collect();

        let question_name_to_id: HashMap<String, String> = spec
            .survey
            .questions
            .iter()
            .zip(question_ids.iter())
            .map(|(q, id)| (q.question_name.clone(), id.clone()))
            .collect();

        // Persist shared resources, offloading file payloads to blobs
        let mut scenarios_batch = Vec::with_capacity(scenarios.len());
        for (scenario, scenario_id) in scenarios.iter().zip(scenario_ids.iter()) {
            let mut data = serde_json::to_value(scenario).map_err(kvstore::StoreError::Serde)?;
            data = self.offload_scenario_files(&job_id, scenario_id, data)?;
            scenarios_batch.push((scenario_id.clone(), data));
        }
        self.jobs().write_scenarios_batch(&job_id, scenarios_batch)?;

        let agents_batch = agents
            .iter()
            .zip(agent_ids.iter())
            .map(|(a, id)| Ok((id.clone(), serde_json::to_value(a).map_err(kvstore::StoreError::Serde)?)))
            .collect::<Result<Vec<_>, ServiceError>>()?;
        self.jobs().write_agents_batch(&job_id, agents_batch)?;

        let models_batch = spec
            .models
            .iter()
            .zip(model_ids.iter())
            .map(|(m, id)| {
                Ok((id.clone(), serde_json::to_value(&m.spec).map_err(kvstore::StoreError::Serde)?))
            })
            .collect::<Result<Vec<_>, ServiceError>>()?;
        self.jobs().write_models_batch(&job_id, models_batch)?;

        let questions_batch = spec
            .survey
            .questions
            .iter()
            .zip(question_ids.iter())
            .map(|(q, id)| Ok((id.clone(), serde_json::to_value(q).map_err(kvstore::StoreError::Serde)?)))
            .collect::<Result<Vec<_>, ServiceError>>()?;
        self.jobs().write_questions_batch(&job_id, questions_batch)?;

        self.jobs().write_survey(
            &job_id,
            serde_json::to_value(&spec.survey).map_err(kvstore::StoreError::Serde)?,
        )?;

        // Register executing clients for this job
        for (model, model_id) in spec.models.iter().zip(model_ids.iter()) {
            self.register_model_client(&job_id, model_id, model.client.clone());
        }

        // Enumerate interviews: cross-product x iterations
        let mut interview_definitions = Vec::new();
        let mut all_task_definitions = Vec::new();
        let mut direct_tasks = Vec::new();

        for (scenario, scenario_id) in scenarios.iter().zip(scenario_ids.iter()) {
            for (agent, agent_id) in agents.iter().zip(agent_ids.iter()) {
                for model_id in model_ids.iter() {
                    for iteration in 0..n_iterations {
                        let interview_id = generate_id();

                        let permutations =
                            generate_question_permutations(&spec.survey);

                        let task_defs = create_tasks_for_interview(
                            &job_id,
                            &interview_id,
                            scenario_id,
                            agent_id,
                            model_id,
                            &spec.survey,
                            &question_name_to_id,
                            &dag,
                            iteration,
                            agent,
                        );

                        for task_def in &task_defs {
                            if task_def.execution_type != ExecutionType::Llm {
                                let question = spec
                                    .survey
                                    .question_by_name(&task_def.question_name)
                                    .cloned();
                                if let Some(question) = question {
                                    direct_tasks.push(DirectTaskEntry {
                                        task_id: task_def.task_id.clone(),
                                        interview_id: interview_id.clone(),
                                        execution_type: task_def.execution_type,
                                        agent: agent.clone(),
                                        question,
                                        scenario: scenario.clone(),
                                    });
                                }
                            }
                        }

                        interview_definitions.push(InterviewDefinition {
                            interview_id: interview_id.clone(),
                            job_id: job_id.clone(),
                            scenario_id: scenario_id.clone(),
                            agent_id: agent_id.clone(),
                            model_id: model_id.clone(),
                            iteration,
                            total_tasks: task_defs.len(),
                            task_ids: task_defs.iter().map(|t| t.task_id.clone()).collect(),
                            question_option_permutations: permutations,
                        });
                        all_task_definitions.extend(task_defs);
                    }
                }
            }
        }

        // Batch create tasks (chunked) and interviews
        const TASK_BATCH_SIZE: usize = 1000;
        for chunk in all_task_definitions.chunks(TASK_BATCH_SIZE) {
            self.tasks().create_batch(chunk)?;
        }
        self.interviews().create_batch(&interview_definitions)?;

        // Retry policies: overrides merged over the shipped table
        let mut retry_policies = default_retry_policies();
        retry_policies.extend(options.retry_policies);

        let job_def = JobDefinition {
            job_id: job_id.clone(),
            user_id: options.user_id,
            created_at: Utc::now(),
            total_interviews: interview_definitions.len(),
            interview_ids: interview_definitions
                .iter()
                .map(|i| i.interview_id.clone())
                .collect(),
            dag,
            scenario_ids,
            agent_ids,
            model_ids,
            question_ids,
            retry_policies,
            n_iterations,
        };
        self.jobs().create(&job_def)?;

        info!(
            job_id = %job_id,
            interviews = interview_definitions.len(),
            tasks = all_task_definitions.len(),
            direct_tasks = direct_tasks.len(),
            "Job submitted"
        );

        Ok(SubmittedJob {
            job_id,
            total_interviews: interview_definitions.len(),
            total_tasks: all_task_definitions.len(),
            direct_tasks,
        })
    }

    /// Move file payloads out of a scenario into blob storage, leaving a
    /// sentinel and blob reference inline.
    fn offload_scenario_files(
        &self,
        job_id: &str,
        scenario_id: &str,
        scenario_data: Value,
    ) -> Result<Value, ServiceError> {
        let Value::Object(map) = scenario_data else {
            return Ok(scenario_data);
        };

        let mut modified = serde_json::Map::with_capacity(map.len());
        for (key, value) in map {
            if let Some(obj) = value.as_object()
                && is_filestore_value(obj)
                && let Some(base64_string) = obj.get("base64_string").and_then(Value::as_str)
                && base64_string != "offloaded"
            {
                let blob_id = format!("blob:{job_id}:{scenario_id}:{key}");
                let data = BASE64
                    .decode(base64_string)
                    .map_err(|e| ServiceError::InvalidJob(format!("bad file payload: {e}")))?;
                let metadata = json!({
                    "job_id": job_id,
                    "scenario_id": scenario_id,
                    "field_key": key,
                    "mime_type": obj.get("mime_type"),
                    "suffix": obj.get("suffix"),
                });
                self.storage().write_blob(&blob_id, &data, Some(metadata))?;
                debug!(blob_id = %blob_id, bytes = data.len(), "Offloaded scenario file");

                let mut replaced = obj.clone();
                replaced.insert("base64_string".to_string(), Value::from("offloaded"));
                replaced.insert("_blob_id".to_string(), Value::from(blob_id));
                modified.insert(key, Value::Object(replaced));
            } else {
                modified.insert(key, value);
            }
        }
        Ok(Value::Object(modified))
    }
}

/// A value is file-shaped when it carries the three file-store fields.
pub(crate) fn is_filestore_value(obj: &serde_json::Map<String, Value>) -> bool {
    obj.contains_key("base64_string") && obj.contains_key("mime_type") && obj.contains_key("suffix")
}

/// Random option order per interview for the randomized questions.
fn generate_question_permutations(survey: &Survey) -> HashMap<String, Vec<Value>> {
    if survey.questions_to_randomize.is_empty() {
        return HashMap::new();
    }

    let mut rng = rand::rng();
    let mut permutations = HashMap::new();
    for question in &survey.questions {
        if !survey.questions_to_randomize.contains(&question.question_name) {
            continue;
        }
        if let Some(Value::Array(options)) = &question.question_options
            && options.len() > 1
        {
            let mut permuted = options.clone();
            permuted.shuffle(&mut rng);
            permutations.insert(question.question_name.clone(), permuted);
        }
    }
    permutations
}

/// Create all task definitions for one interview, projecting the
/// question-name DAG into task-id edges (forward and reverse).
#[allow(clippy::too_many_arguments)]
fn create_tasks_for_interview(
    job_id: &str,
    interview_id: &str,
    scenario_id: &str,
    agent_id: &str,
    model_id: &str,
    survey: &Survey,
    question_name_to_id: &HashMap<String, String>,
    dag: &HashMap<String, HashSet<String>>,
    iteration: u32,
    agent: &Agent,
) -> Vec<TaskDefinition> {
    // Task ids first so edges can be projected in one pass
    let task_ids: Vec<String> = survey.questions.iter().map(|_| generate_id()).collect();
    let name_to_task_id: HashMap<&str, &str> = survey
        .questions
        .iter()
        .zip(task_ids.iter())
        .map(|(q, tid)| (q.question_name.as_str(), tid.as_str()))
        .collect();

    let mut depends_on: HashMap<&str, Vec<String>> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<String>> = HashMap::new();
    for (question_name, prereq_names) in dag {
        let Some(&task_id) = name_to_task_id.get(question_name.as_str()) else {
            continue;
        };
        for prereq_name in prereq_names {
            if let Some(&prereq_task_id) = name_to_task_id.get(prereq_name.as_str()) {
                depends_on.entry(task_id).or_default().push(prereq_task_id.to_string());
                dependents.entry(prereq_task_id).or_default().push(task_id.to_string());
            }
        }
    }

    survey
        .questions
        .iter()
        .zip(task_ids.iter())
        .map(|(question, task_id)| TaskDefinition {
            task_id: task_id.clone(),
            job_id: job_id.to_string(),
            interview_id: interview_id.to_string(),
            scenario_id: scenario_id.to_string(),
            agent_id: agent_id.to_string(),
            model_id: model_id.to_string(),
            question_id: question_name_to_id
                .get(&question.question_name)
                .cloned()
                .unwrap_or_default(),
            question_name: question.question_name.clone(),
            iteration,
            depends_on: depends_on.remove(task_id.as_str()).unwrap_or_default(),
            dependents: dependents.remove(task_id.as_str()).unwrap_or_default(),
            execution_type: detect_execution_type(agent, question),
        })
        .collect()
}
