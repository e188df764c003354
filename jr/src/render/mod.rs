//! Prompt rendering pipeline
//!
//! READY tasks are popped in batches, run through skip evaluation, rendered
//! into prompts via the [`PromptRenderer`] capability, priced with a token
//! estimate and a deterministic cache key, and handed to the coordinator as
//! [`RenderedPrompt`]s.

mod prompt;
mod worker;

pub use prompt::{HandlebarsRenderer, PromptRenderer, RenderError, RenderedParts, resolve_question_options};
pub use worker::RenderWorker;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::llm::FileRef;

/// A task rendered and ready for dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedPrompt {
    pub task_id: String,
    pub job_id: String,
    pub interview_id: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub estimated_tokens: u32,
    pub cache_key: String,
    pub question_name: String,
    pub model_id: String,
    pub model_name: String,
    pub service_name: String,
    pub iteration: u32,
    pub files: Option<Vec<FileRef>>,
}

/// Rough token estimate for rate limiting: four characters per token plus
/// headroom for the response.
pub fn estimate_tokens(system_prompt: &str, user_prompt: &str) -> u32 {
    ((system_prompt.len() + user_prompt.len()) / 4 + 500) as u32
}

/// Deterministic cache key over everything that shapes a completion.
/// Iteration participates so multi-iteration jobs don't share entries.
pub fn compute_cache_key(
    model_name: &str,
    parameters: &serde_json::Map<String, Value>,
    system_prompt: &str,
    user_prompt: &str,
    iteration: u32,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.update([0]);
    // serde_json maps are sorted, so this serialization is canonical
    hasher.update(serde_json::to_string(parameters).unwrap_or_default().as_bytes());
    hasher.update([0]);
    hasher.update(system_prompt.as_bytes());
    hasher.update([0]);
    hasher.update(user_prompt.as_bytes());
    hasher.update([0]);
    hasher.update(iteration.to_le_bytes());

    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("", ""), 500);
        let sys = "a".repeat(100);
        let user = "b".repeat(300);
        assert_eq!(estimate_tokens(&sys, &user), 600);
    }

    #[test]
    fn test_cache_key_deterministic() {
        let mut params = serde_json::Map::new();
        params.insert("temperature".to_string(), json!(0.7));

        let a = compute_cache_key("m", &params, "sys", "user", 0);
        let b = compute_cache_key("m", &params, "sys", "user", 0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_cache_key_varies_by_iteration() {
        let params = serde_json::Map::new();
        let it0 = compute_cache_key("m", &params, "sys", "user", 0);
        let it1 = compute_cache_key("m", &params, "sys", "user", 1);
        assert_ne!(it0, it1);
    }

    #[test]
    fn test_cache_key_varies_by_prompt() {
        let params = serde_json::Map::new();
        let a = compute_cache_key("m", &params, "sys", "user a", 0);
        let b = compute_cache_key("m", &params, "sys", "user b", 0);
        assert_ne!(a, b);
    }
}
