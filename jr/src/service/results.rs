//! Results assembly
//!
//! Builds one typed result per terminal interview from persisted answers.
//! Assembly reads in at most four batch rounds: definitions, shared
//! resources, interview states, and answers (always fetched by known
//! question names, never by scan).

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{JobService, ServiceError};
use crate::domain::InterviewState;

/// Prompts used for one question.
#[derive(Debug, Clone, Serialize)]
pub struct PromptPair {
    pub system_prompt: String,
    pub user_prompt: String,
}

/// The assembled outcome of one interview.
#[derive(Debug, Clone, Serialize)]
pub struct InterviewResult {
    pub job_id: String,
    pub interview_id: String,

    /// Deterministic hash over (agent, scenario, model, iteration)
    pub interview_hash: String,

    pub scenario: Value,
    pub agent: Value,
    pub model: Value,
    pub iteration: u32,
    pub state: InterviewState,

    /// One entry per survey question; null where no answer exists
    pub answers: HashMap<String, Value>,
    pub comments: HashMap<String, String>,
    pub prompts: HashMap<String, PromptPair>,
    pub raw_responses: HashMap<String, Value>,
    pub generated_tokens: HashMap<String, String>,
    pub reasoning_summaries: HashMap<String, String>,
    pub validated: HashMap<String, bool>,
    pub cache_used: HashMap<String, bool>,
    pub cache_keys: HashMap<String, String>,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: Option<f64>,
}

impl JobService {
    /// Assemble results for every terminal interview of a job.
    pub fn build_results(&self, job_id: &str) -> Result<Vec<InterviewResult>, ServiceError> {
        // Round 1: definitions
        let Some(job_def) = self.jobs().get_definition(job_id)? else {
            return Err(ServiceError::JobNotFound(job_id.to_string()));
        };
        let interview_defs = self
            .interviews()
            .get_definitions_batch(job_id, &job_def.interview_ids)?;
        let questions = self
            .jobs()
            .get_resources_batch(job_id, "question", &job_def.question_ids)?;

        let question_names: Vec<String> = job_def
            .question_ids
            .iter()
            .filter_map(|qid| {
                questions
                    .get(qid)
                    .and_then(|q| q.get("question_name"))
                    .and_then(Value::as_str)
                    .map(String::from)
            })
            .collect();

        // Round 2: shared resources
        let scenarios = self
            .jobs()
            .get_resources_batch(job_id, "scenario", &job_def.scenario_ids)?;
        let agents = self
            .jobs()
            .get_resources_batch(job_id, "agent", &job_def.agent_ids)?;
        let models = self
            .jobs()
            .get_resources_batch(job_id, "model", &job_def.model_ids)?;

        // Round 3: interview states
        let states = self.interviews().get_states_batch(&job_def.interview_ids)?;
        let terminal_ids: Vec<String> = job_def
            .interview_ids
            .iter()
            .filter(|iid| {
                states
                    .get(*iid)
                    .map(|s| s.is_terminal())
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        // Round 4: answers for terminal interviews
        let all_answers =
            self.answers()
                .get_for_interviews_batch(job_id, &terminal_ids, &question_names)?;

        let mut results = Vec::with_capacity(terminal_ids.len());
        for interview_id in &terminal_ids {
            let Some(interview_def) = interview_defs.get(interview_id) else {
                continue;
            };
            let scenario = scenarios
                .get(&interview_def.scenario_id)
                .cloned()
                .unwrap_or(Value::Null);
            let agent = agents
                .get(&interview_def.agent_id)
                .cloned()
                .unwrap_or(Value::Null);
            let model = models
                .get(&interview_def.model_id)
                .cloned()
                .unwrap_or(Value::Null);

            let mut answers = HashMap::new();
            let mut comments = HashMap::new();
            let mut prompts = HashMap::new();
            let mut raw_responses = HashMap::new();
            let mut generated_tokens = HashMap::new();
            let mut reasoning_summaries = HashMap::new();
            let mut validated = HashMap::new();
            let mut cache_used = HashMap::new();
            let mut cache_keys = HashMap::new();
            let mut input_tokens = 0u64;
            let mut output_tokens = 0u64;
            let mut cost = 0.0f64;
            let mut any_priced = false;

            let interview_answers = all_answers.get(interview_id);
            for question_name in &question_names {
                let answer = interview_answers.and_then(|a| a.get(question_name));
                answers.insert(
                    question_name.clone(),
                    answer.map(|a| a.answer.clone()).unwrap_or(Value::Null),
                );

                let Some(answer) = answer else { continue };
                if let Some(comment) = &answer.comment {
                    comments.insert(question_name.clone(), comment.clone());
                }
                if let (Some(system), Some(user)) = (&answer.system_prompt, &answer.user_prompt) {
                    prompts.insert(
                        question_name.clone(),
                        PromptPair {
                            system_prompt: system.clone(),
                            user_prompt: user.clone(),
                        },
                    );
                }
                if let Some(raw) = &answer.raw_model_response {
                    raw_responses.insert(question_name.clone(), raw.clone());
                }
                if let Some(tokens) = &answer.generated_tokens {
                    generated_tokens.insert(question_name.clone(), tokens.clone());
                }
                if let Some(reasoning) = &answer.reasoning_summary {
                    reasoning_summaries.insert(question_name.clone(), reasoning.clone());
                }
                if let Some(v) = answer.validated {
                    validated.insert(question_name.clone(), v);
                }
                cache_used.insert(question_name.clone(), answer.cached);
                if let Some(key) = &answer.cache_key {
                    cache_keys.insert(question_name.clone(), key.clone());
                }

                let answer_input = answer.input_tokens.unwrap_or(0);
                let answer_output = answer.output_tokens.unwrap_or(0);
                input_tokens += answer_input;
                output_tokens += answer_output;
                if let (Some(in_price), Some(out_price)) = (
                    answer.input_price_per_million_tokens,
                    answer.output_price_per_million_tokens,
                ) {
                    cost += answer_input as f64 / 1_000_000.0 * in_price
                        + answer_output as f64 / 1_000_000.0 * out_price;
                    any_priced = true;
                }
            }

            results.push(InterviewResult {
                job_id: job_id.to_string(),
                interview_id: interview_id.clone(),
                interview_hash: interview_hash(
                    &agent,
                    &scenario,
                    &model,
                    interview_def.iteration,
                ),
                scenario,
                agent,
                model,
                iteration: interview_def.iteration,
                state: states
                    .get(interview_id)
                    .copied()
                    .unwrap_or(InterviewState::Running),
                answers,
                comments,
                prompts,
                raw_responses,
                generated_tokens,
                reasoning_summaries,
                validated,
                cache_used,
                cache_keys,
                input_tokens,
                output_tokens,
                total_cost_usd: if any_priced { Some(cost) } else { None },
            });
        }

        Ok(results)
    }
}

/// Deterministic hash identifying the (agent, scenario, model, iteration)
/// combination. serde_json maps serialize with sorted keys, so the input
/// is canonical.
fn interview_hash(agent: &Value, scenario: &Value, model: &Value, iteration: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(scenario.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(model.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(iteration.to_le_bytes());
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}
