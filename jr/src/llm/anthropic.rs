//! Anthropic Messages API client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{LanguageModel, LlmError, ModelRequest, ModelResponse};
use crate::survey::ModelSpec;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Backoff assumed when a throttling response omits a retry hint.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Anthropic-style Messages API client.
pub struct AnthropicModel {
    model: String,
    parameters: serde_json::Map<String, Value>,
    api_key: String,
    base_url: String,
    http: Client,
}

impl AnthropicModel {
    /// Build a client from a stored model spec and an API key.
    pub fn from_spec(spec: &ModelSpec, api_key: impl Into<String>) -> Result<Self, LlmError> {
        let timeout = spec
            .parameters
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(300_000);

        let http = Client::builder()
            .timeout(Duration::from_millis(timeout))
            .build()
            .map_err(LlmError::Transport)?;

        Ok(Self {
            model: spec.model.clone(),
            parameters: spec.parameters.clone(),
            api_key: api_key.into(),
            base_url: spec
                .parameters
                .get("base_url")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_BASE_URL)
                .to_string(),
            http,
        })
    }

    fn build_request_body(&self, request: &ModelRequest) -> Value {
        let max_tokens = self
            .parameters
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let mut content = vec![json!({"type": "text", "text": request.user_prompt})];
        if let Some(files) = &request.files {
            for file in files {
                content.push(json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": file.mime_type.as_deref().unwrap_or("image/png"),
                        "data": file.base64_string,
                    },
                }));
            }
        }

        let mut body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "system": request.system_prompt,
            "messages": [{"role": "user", "content": content}],
        });

        if let Some(temperature) = self.parameters.get("temperature") {
            body["temperature"] = temperature.clone();
        }

        body
    }

    fn parse_response(&self, api_response: AnthropicResponse, raw: Value) -> ModelResponse {
        let text = api_response
            .content
            .iter()
            .find_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.clone()),
            })
            .unwrap_or_default();

        ModelResponse {
            answer: Value::String(text.clone()),
            comment: None,
            generated_tokens: Some(text),
            reasoning_summary: None,
            input_tokens: Some(api_response.usage.input_tokens),
            output_tokens: Some(api_response.usage.output_tokens),
            raw_response: Some(raw),
            cache_used: false,
            cache_key: None,
            input_price_per_million_tokens: None,
            output_price_per_million_tokens: None,
        }
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    async fn get_response(&self, request: ModelRequest) -> Result<ModelResponse, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_request_body(&request);

        let response = self
            .http
            .post(url)
            .header("x-api-key", self.api_key.clone())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(failure_from(response).await);
        }

        let raw: Value = response.json().await?;
        let api_response: AnthropicResponse = serde_json::from_value(raw.clone())?;
        let mut parsed = self.parse_response(api_response, raw);
        parsed.cache_key = Some(request.cache_key);
        Ok(parsed)
    }
}

/// Turn a non-success response into the matching failure. Throttling is
/// recognized first so the retry hint survives; everything else keeps
/// its status and body for classification.
async fn failure_from(response: reqwest::Response) -> LlmError {
    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return LlmError::Throttled {
            retry_after: parse_retry_after(response.headers()),
        };
    }

    LlmError::Provider {
        status: status.as_u16(),
        body: response.text().await.unwrap_or_default(),
    }
}

/// Seconds from the Retry-After header, or the fallback backoff when the
/// header is absent or not a plain number.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Duration {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(FALLBACK_RETRY_AFTER)
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u64,
    output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ModelSpec {
        let mut spec = ModelSpec::new("claude-3-5-haiku-20241022", "anthropic");
        spec.parameters.insert("temperature".to_string(), json!(0.5));
        spec.parameters.insert("max_tokens".to_string(), json!(1024));
        spec
    }

    #[test]
    fn test_build_request_body() {
        let model = AnthropicModel::from_spec(&spec(), "key").unwrap();
        let body = model.build_request_body(&ModelRequest {
            system_prompt: "You are terse.".to_string(),
            user_prompt: "Say hi".to_string(),
            iteration: 0,
            files: None,
            cache_key: "ck".to_string(),
        });

        assert_eq!(body["model"], "claude-3-5-haiku-20241022");
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["system"], "You are terse.");
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["messages"][0]["content"][0]["text"], "Say hi");
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = reqwest::header::HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), FALLBACK_RETRY_AFTER);

        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Duration::from_secs(12));

        // HTTP-date form is not parsed; fall back to the default backoff
        headers.insert(
            reqwest::header::RETRY_AFTER,
            "Fri, 01 Aug 2026 00:00:00 GMT".parse().unwrap(),
        );
        assert_eq!(parse_retry_after(&headers), FALLBACK_RETRY_AFTER);
    }

    #[test]
    fn test_parse_response() {
        let model = AnthropicModel::from_spec(&spec(), "key").unwrap();
        let raw = json!({
            "content": [{"type": "text", "text": "hello"}],
            "usage": {"input_tokens": 12, "output_tokens": 3}
        });
        let api_response: AnthropicResponse = serde_json::from_value(raw.clone()).unwrap();
        let parsed = model.parse_response(api_response, raw);

        assert_eq!(parsed.answer, json!("hello"));
        assert_eq!(parsed.input_tokens, Some(12));
        assert_eq!(parsed.output_tokens, Some(3));
        assert!(parsed.raw_response.is_some());
    }
}
