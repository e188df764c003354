//! Model call failures and the closed error-kind set

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ways a model call can fail.
///
/// Providers differ in how they report trouble, so the variants capture
/// the distinctions the engine acts on: throttling carries a retry hint,
/// provider errors carry the HTTP status for retry classification, and
/// refusals are kept apart from malformed output.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("provider throttled the request, retry in {retry_after:?}")]
    Throttled { retry_after: Duration },

    #[error("provider returned HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("request transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("response could not be interpreted: {0}")]
    Malformed(String),

    #[error("model refused the prompt: {0}")]
    Refused(String),

    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl LlmError {
    /// Check if this failure is worth retrying
    pub fn is_retryable(&self) -> bool {
        self.kind().default_retryable()
    }

    /// Classify into the closed kind set used by retry policies.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LlmError::Throttled { .. } => ErrorKind::RateLimit,
            LlmError::Provider { status, body } => match *status {
                429 => ErrorKind::RateLimit,
                s if s >= 500 => ErrorKind::ServerError,
                // 4xx bodies sometimes carry a refusal; surface it as one
                _ => match ErrorKind::classify_message(body) {
                    ErrorKind::ContentPolicy => ErrorKind::ContentPolicy,
                    _ => ErrorKind::InvalidRequest,
                },
            },
            LlmError::Transport(_) => ErrorKind::NetworkTimeout,
            LlmError::Malformed(_) => ErrorKind::InvalidRequest,
            LlmError::Refused(_) => ErrorKind::ContentPolicy,
            LlmError::Encoding(_) => ErrorKind::Unknown,
        }
    }
}

/// The closed set of error kinds used throughout the engine.
///
/// Kinds key the retry-policy table and are persisted as snake_case
/// strings in task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTimeout,
    RateLimit,
    ServerError,
    InvalidRequest,
    ContentPolicy,
    /// No queue and no API key for the task's service/model
    NoQueue,
    DirectAnswerError,
    /// Blocked by a failed upstream dependency
    UpstreamFailure,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NetworkTimeout => "network_timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ContentPolicy => "content_policy",
            ErrorKind::NoQueue => "no_queue",
            ErrorKind::DirectAnswerError => "direct_answer_error",
            ErrorKind::UpstreamFailure => "upstream_failure",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether this kind is retried when no policy entry exists for it.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTimeout
                | ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::Unknown
        )
    }

    /// Best-effort classification from free-form error text.
    pub fn classify_message(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("timeout") {
            ErrorKind::NetworkTimeout
        } else if lower.contains("rate") || lower.contains("429") {
            ErrorKind::RateLimit
        } else if lower.contains("500") || lower.contains("502") || lower.contains("503") {
            ErrorKind::ServerError
        } else if lower.contains("content") && lower.contains("policy") {
            ErrorKind::ContentPolicy
        } else if lower.contains("invalid") || lower.contains("400") {
            ErrorKind::InvalidRequest
        } else {
            ErrorKind::Unknown
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            LlmError::Throttled {
                retry_after: Duration::from_secs(60)
            }
            .kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            LlmError::Provider {
                status: 503,
                body: "overloaded".to_string()
            }
            .kind(),
            ErrorKind::ServerError
        );
        assert_eq!(
            LlmError::Provider {
                status: 429,
                body: "slow down".to_string()
            }
            .kind(),
            ErrorKind::RateLimit
        );
        assert_eq!(
            LlmError::Provider {
                status: 400,
                body: "bad request".to_string()
            }
            .kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            LlmError::Malformed("not json".to_string()).kind(),
            ErrorKind::InvalidRequest
        );
        assert_eq!(
            LlmError::Refused("unsafe prompt".to_string()).kind(),
            ErrorKind::ContentPolicy
        );
    }

    #[test]
    fn test_provider_refusal_body_classified() {
        // A 4xx whose body names a content policy violation is surfaced
        // as a refusal, not a generic invalid request
        assert_eq!(
            LlmError::Provider {
                status: 400,
                body: "request blocked by content policy".to_string()
            }
            .kind(),
            ErrorKind::ContentPolicy
        );
    }

    #[test]
    fn test_retryability() {
        assert!(ErrorKind::ServerError.default_retryable());
        assert!(ErrorKind::RateLimit.default_retryable());
        assert!(!ErrorKind::InvalidRequest.default_retryable());
        assert!(!ErrorKind::ContentPolicy.default_retryable());
        assert!(!ErrorKind::NoQueue.default_retryable());
        assert!(!ErrorKind::UpstreamFailure.default_retryable());

        assert!(
            LlmError::Throttled {
                retry_after: Duration::from_secs(5)
            }
            .is_retryable()
        );
        assert!(!LlmError::Refused("no".to_string()).is_retryable());
    }

    #[test]
    fn test_classify_message() {
        assert_eq!(
            ErrorKind::classify_message("Connection timeout after 30s"),
            ErrorKind::NetworkTimeout
        );
        assert_eq!(
            ErrorKind::classify_message("HTTP 429 rate limit exceeded"),
            ErrorKind::RateLimit
        );
        assert_eq!(
            ErrorKind::classify_message("server returned 502"),
            ErrorKind::ServerError
        );
        assert_eq!(
            ErrorKind::classify_message("content policy violation"),
            ErrorKind::ContentPolicy
        );
        assert_eq!(ErrorKind::classify_message("who knows"), ErrorKind::Unknown);
    }

    #[test]
    fn test_as_str_snake_case() {
        assert_eq!(ErrorKind::NetworkTimeout.as_str(), "network_timeout");
        assert_eq!(ErrorKind::UpstreamFailure.as_str(), "upstream_failure");
        let json = serde_json::to_string(&ErrorKind::NoQueue).unwrap();
        assert_eq!(json, "\"no_queue\"");
    }
}
