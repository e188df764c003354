//! Batch rendering of ready tasks
//!
//! Pops READY tasks in a batch and walks them through skip evaluation and
//! prompt rendering with a bounded number of storage round trips: batch
//! pops, batch definition fetches, answer reads by known question names
//! (never scans), and batch status writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use kvstore::Storage;
use serde_json::Value;
use tracing::{debug, warn};

use super::prompt::{PromptRenderer, resolve_question_options};
use super::{RenderedPrompt, compute_cache_key, estimate_tokens};
use crate::domain::{Answer, ExecutionType, TaskStatus};
use crate::service::{JobService, ServiceError, SkipContext};
use crate::survey::{Agent, ModelSpec, Question, Scenario, Survey};

/// Renders ready tasks for dispatch.
pub struct RenderWorker {
    service: Arc<JobService>,
    renderer: Arc<dyn PromptRenderer>,
}

impl RenderWorker {
    pub fn new(service: Arc<JobService>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self { service, renderer }
    }

    /// Pop up to `max_tasks` ready tasks and render the LLM ones.
    ///
    /// Tasks whose skip rules fire are routed through the skip path;
    /// non-LLM tasks go back to the ready set for the direct-answer
    /// executor. Rendered tasks transition READY -> RENDERING -> QUEUED.
    pub fn render_ready_tasks(
        &self,
        job_id: &str,
        max_tasks: usize,
    ) -> Result<Vec<RenderedPrompt>, ServiceError> {
        let tasks = self.service.tasks();

        let task_ids = tasks.pop_ready_tasks_batch(job_id, max_tasks)?;
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!(job_id, count = task_ids.len(), "Popped ready tasks");

        // Locations, grouped by interview for batched definition reads
        let locations = tasks.get_locations_batch(&task_ids)?;
        let mut by_interview: HashMap<String, Vec<String>> = HashMap::new();
        for task_id in &task_ids {
            if let Some((_, interview_id)) = locations.get(task_id) {
                by_interview
                    .entry(interview_id.clone())
                    .or_default()
                    .push(task_id.clone());
            }
        }

        let interview_ids: Vec<String> = by_interview.keys().cloned().collect();
        let interview_defs = self
            .service
            .interviews()
            .get_definitions_batch(job_id, &interview_ids)?;

        let mut task_defs = HashMap::new();
        for (interview_id, ids) in &by_interview {
            task_defs.extend(tasks.get_definitions_batch(job_id, interview_id, ids)?);
        }

        // Shared per-job caches for skip evaluation
        let Some(job_def) = self.service.jobs().get_definition(job_id)? else {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        };
        let Some(survey_data) = self.service.jobs().get_survey(job_id)? else {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        };
        let survey: Survey =
            serde_json::from_value(survey_data).map_err(kvstore::StoreError::Serde)?;
        let question_index_map = survey.question_index_map();

        // Union of referenced resources
        let scenario_ids = unique(task_defs.values().map(|d| d.scenario_id.clone()));
        let agent_ids = unique(task_defs.values().map(|d| d.agent_id.clone()));
        let model_ids = unique(task_defs.values().map(|d| d.model_id.clone()));
        let question_ids = unique(task_defs.values().map(|d| d.question_id.clone()));

        let scenarios = self
            .service
            .jobs()
            .get_resources_batch(job_id, "scenario", &scenario_ids)?;
        let agents = self
            .service
            .jobs()
            .get_resources_batch(job_id, "agent", &agent_ids)?;

        // Per-interview prior answers, restricted to the transitive
        // dependency closure of the popped tasks (O(D) reads, not O(T))
        let mut answers_by_interview: HashMap<String, HashMap<String, Answer>> = HashMap::new();
        for (interview_id, ids) in &by_interview {
            let names: Vec<String> = ids
                .iter()
                .filter_map(|tid| task_defs.get(tid))
                .map(|d| d.question_name.clone())
                .collect();
            let dep_names = transitive_dependency_names(&job_def.dag, &names);
            let answers = self
                .service
                .answers()
                .get_for_interview(job_id, interview_id, &dep_names)?;
            answers_by_interview.insert(interview_id.clone(), answers);
        }

        // Skip evaluation; partition into render / direct / skipped
        let mut to_render = Vec::new();
        for task_id in &task_ids {
            let Some(task_def) = task_defs.get(task_id) else {
                warn!(task_id = %task_id, "Popped task has no definition, dropping");
                continue;
            };
            let interview_id = &task_def.interview_id;
            let empty = HashMap::new();
            let answers = answers_by_interview.get(interview_id).unwrap_or(&empty);

            let skip_reason = self.service.should_skip_with_context(&SkipContext {
                survey: &survey,
                question_index_map: &question_index_map,
                answers,
                scenario: scenarios.get(&task_def.scenario_id),
                agent: agents.get(&task_def.agent_id),
                task_def,
            })?;

            if let Some(reason) = skip_reason {
                self.service
                    .on_task_skipped(job_id, interview_id, task_id, Some(&reason))?;
                continue;
            }

            if task_def.execution_type != ExecutionType::Llm {
                // Direct-answer tasks bypass rendering; the client-side
                // executor picks them up from the ready set
                tasks.add_to_ready(job_id, task_id)?;
                continue;
            }

            to_render.push(task_id.clone());
        }

        if to_render.is_empty() {
            return Ok(Vec::new());
        }
        tasks.set_statuses_batch(&to_render, TaskStatus::Rendering)?;

        let models = self
            .service
            .jobs()
            .get_resources_batch(job_id, "model", &model_ids)?;
        let questions = self
            .service
            .jobs()
            .get_resources_batch(job_id, "question", &question_ids)?;

        // Scenarios with offloaded files restored, decoded once per id
        let mut restored_scenarios: HashMap<String, Scenario> = HashMap::new();
        for id in &scenario_ids {
            let data = scenarios.get(id).cloned().unwrap_or(Value::Null);
            let restored = self.restore_scenario_files(data)?;
            restored_scenarios.insert(
                id.clone(),
                serde_json::from_value(restored).unwrap_or_default(),
            );
        }

        let mut rendered = Vec::with_capacity(to_render.len());
        let mut queued_ids = Vec::with_capacity(to_render.len());
        for task_id in &to_render {
            let Some(task_def) = task_defs.get(task_id) else {
                continue;
            };
            let Some(interview_def) = interview_defs.get(&task_def.interview_id) else {
                self.service.on_task_failed(
                    job_id,
                    &task_def.interview_id,
                    task_id,
                    "invalid_request",
                    "Interview definition missing",
                )?;
                continue;
            };

            let scenario = restored_scenarios
                .get(&task_def.scenario_id)
                .cloned()
                .unwrap_or_default();
            let agent: Agent = agents
                .get(&task_def.agent_id)
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(kvstore::StoreError::Serde)?
                .unwrap_or_default();
            let model_spec: ModelSpec = match models.get(&task_def.model_id) {
                Some(v) => serde_json::from_value(v.clone()).map_err(kvstore::StoreError::Serde)?,
                None => {
                    warn!(task_id = %task_id, model_id = %task_def.model_id, "Model definition missing");
                    self.service.on_task_failed(
                        job_id,
                        &task_def.interview_id,
                        task_id,
                        "invalid_request",
                        "Model definition missing",
                    )?;
                    continue;
                }
            };
            let mut question: Question = match questions.get(&task_def.question_id) {
                Some(v) => serde_json::from_value(v.clone()).map_err(kvstore::StoreError::Serde)?,
                None => {
                    warn!(task_id = %task_id, question_id = %task_def.question_id, "Question definition missing");
                    self.service.on_task_failed(
                        job_id,
                        &task_def.interview_id,
                        task_id,
                        "invalid_request",
                        "Question definition missing",
                    )?;
                    continue;
                }
            };

            let empty = HashMap::new();
            let answers = answers_by_interview
                .get(&task_def.interview_id)
                .unwrap_or(&empty);
            let prior_answers: HashMap<String, Value> = answers
                .iter()
                .map(|(name, answer)| (name.clone(), answer.answer.clone()))
                .collect();

            // Resolve option templates, then apply this interview's
            // randomized permutation on top
            if let Some(options) = &question.question_options {
                let resolved = resolve_question_options(options, &prior_answers, &scenario);
                question.question_options = Some(resolved);
            }
            if let Some(permuted) = interview_def
                .question_option_permutations
                .get(&task_def.question_name)
            {
                question.question_options = Some(Value::Array(permuted.clone()));
            }

            let parts = self
                .renderer
                .render(&scenario, &agent, &model_spec, &question, &prior_answers)?;

            let cache_key = compute_cache_key(
                &model_spec.model,
                &model_spec.parameters,
                &parts.system_prompt,
                &parts.user_prompt,
                task_def.iteration,
            );
            let estimated_tokens = estimate_tokens(&parts.system_prompt, &parts.user_prompt);

            queued_ids.push(task_id.clone());
            rendered.push(RenderedPrompt {
                task_id: task_id.clone(),
                job_id: job_id.to_string(),
                interview_id: task_def.interview_id.clone(),
                system_prompt: parts.system_prompt,
                user_prompt: parts.user_prompt,
                estimated_tokens,
                cache_key,
                question_name: task_def.question_name.clone(),
                model_id: task_def.model_id.clone(),
                model_name: model_spec.model.clone(),
                service_name: model_spec.service.clone(),
                iteration: task_def.iteration,
                files: parts.files,
            });
        }

        tasks.set_statuses_batch(&queued_ids, TaskStatus::Queued)?;
        debug!(job_id, rendered = rendered.len(), "Rendered batch");
        Ok(rendered)
    }

    /// Pull offloaded file payloads back from blob storage into the
    /// scenario's inline form.
    fn restore_scenario_files(&self, scenario_data: Value) -> Result<Value, ServiceError> {
        let Value::Object(map) = scenario_data else {
            return Ok(scenario_data);
        };

        let mut restored = serde_json::Map::with_capacity(map.len());
        for (key, value) in map {
            if let Some(obj) = value.as_object()
                && obj.get("base64_string").and_then(Value::as_str) == Some("offloaded")
                && let Some(blob_id) = obj.get("_blob_id").and_then(Value::as_str)
            {
                match self.service.storage().read_blob(blob_id)? {
                    Some(data) => {
                        let mut replaced = obj.clone();
                        replaced.insert(
                            "base64_string".to_string(),
                            Value::from(BASE64.encode(&data)),
                        );
                        replaced.remove("_blob_id");
                        restored.insert(key, Value::Object(replaced));
                    }
                    None => {
                        warn!(blob_id, "Offloaded blob missing, leaving sentinel");
                        restored.insert(key, value);
                    }
                }
            } else {
                restored.insert(key, value);
            }
        }
        Ok(Value::Object(restored))
    }
}

fn unique(ids: impl Iterator<Item = String>) -> Vec<String> {
    let set: HashSet<String> = ids.collect();
    set.into_iter().collect()
}

/// The transitive prerequisite closure of `names` in the question-name DAG.
fn transitive_dependency_names(
    dag: &HashMap<String, HashSet<String>>,
    names: &[String],
) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack: Vec<&String> = names.iter().collect();
    while let Some(name) = stack.pop() {
        if let Some(parents) = dag.get(name) {
            for parent in parents {
                if seen.insert(parent.clone()) {
                    stack.push(parent);
                }
            }
        }
    }
    let mut result: Vec<String> = seen.into_iter().collect();
    result.sort();
    result
}
