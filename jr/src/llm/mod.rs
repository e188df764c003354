//! LLM client trait and implementations
//!
//! The engine treats the model as an opaque capability: given rendered
//! prompts it returns a typed answer plus usage accounting. The bundled
//! [`AnthropicModel`] talks to an Anthropic-style Messages API; tests use
//! scripted implementations of [`LanguageModel`].

mod anthropic;
mod cache;
mod error;

pub use anthropic::AnthropicModel;
pub use cache::ResponseCache;
pub use error::{ErrorKind, LlmError};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::survey::ModelSpec;

/// A file attached to a prompt (restored from blob storage).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub base64_string: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
}

/// Everything needed for one LLM call.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub user_prompt: String,

    /// Iteration index; participates in the cache key so multi-iteration
    /// jobs don't share cache entries.
    pub iteration: u32,

    pub files: Option<Vec<FileRef>>,
    pub cache_key: String,
}

/// Response from a completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The extracted answer value
    pub answer: Value,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub generated_tokens: Option<String>,
    #[serde(default)]
    pub reasoning_summary: Option<String>,

    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,

    /// Raw provider response for provenance
    #[serde(default)]
    pub raw_response: Option<Value>,

    #[serde(default)]
    pub cache_used: bool,
    #[serde(default)]
    pub cache_key: Option<String>,

    #[serde(default)]
    pub input_price_per_million_tokens: Option<f64>,
    #[serde(default)]
    pub output_price_per_million_tokens: Option<f64>,
}

impl ModelResponse {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
    }
}

/// The model capability: rendered prompts in, typed answer out.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn get_response(&self, request: ModelRequest) -> Result<ModelResponse, LlmError>;
}

/// A model paired with its executing client. The spec serializes and is
/// shared through storage; the client stays on the submitting process.
#[derive(Clone)]
pub struct Model {
    pub spec: ModelSpec,
    pub client: Arc<dyn LanguageModel>,
}

impl Model {
    pub fn new(spec: ModelSpec, client: Arc<dyn LanguageModel>) -> Self {
        Self { spec, client }
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model").field("spec", &self.spec).finish()
    }
}
