//! The persisted outcome of a task

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Answer to one question in one interview.
///
/// Keyed by `(job_id, interview_id, question_name)` and written once per
/// task completion; rewrites under the same key are idempotent. Skipped
/// tasks produce an answer with a null value so results assembly sees one
/// entry per question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub job_id: String,
    pub interview_id: String,
    pub question_name: String,

    /// The answer value; null for skipped tasks
    pub answer: Value,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub user_prompt: Option<String>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
    #[serde(default)]
    pub raw_model_response: Option<Value>,
    #[serde(default)]
    pub generated_tokens: Option<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub input_price_per_million_tokens: Option<f64>,
    #[serde(default)]
    pub output_price_per_million_tokens: Option<f64>,
    #[serde(default)]
    pub cache_key: Option<String>,
    #[serde(default)]
    pub validated: Option<bool>,
    #[serde(default)]
    pub reasoning_summary: Option<String>,
}

impl Answer {
    /// A minimal answer carrying just a value; used by tests and skips.
    pub fn new(
        job_id: impl Into<String>,
        interview_id: impl Into<String>,
        question_name: impl Into<String>,
        answer: Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            interview_id: interview_id.into(),
            question_name: question_name.into(),
            answer,
            created_at: Utc::now(),
            comment: None,
            system_prompt: None,
            user_prompt: None,
            cached: false,
            input_tokens: None,
            output_tokens: None,
            raw_model_response: None,
            generated_tokens: None,
            model_id: None,
            input_price_per_million_tokens: None,
            output_price_per_million_tokens: None,
            cache_key: None,
            validated: None,
            reasoning_summary: None,
        }
    }

    pub fn storage_key(&self) -> String {
        Self::key(&self.job_id, &self.interview_id, &self.question_name)
    }

    pub fn key(job_id: &str, interview_id: &str, question_name: &str) -> String {
        format!("job:{job_id}:interview:{interview_id}:answer:{question_name}")
    }
}
