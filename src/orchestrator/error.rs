//! Error taxonomy for the orchestration pipeline.
//!
//! Every boundary in the pipeline (security gate, policy evaluator, reasoner,
//! agent transport, validator, configuration loader) ultimately produces one of
//! these kinds. The controller never leaks a provider or library exception type
//! to a caller; it always translates into the response envelope.

use std::error::Error;
use std::fmt;

/// The seven error kinds from the error handling design.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Input rejected by the security gate. Never retried.
    Security(String),
    /// A policy evaluator denied the request. Never retried.
    Policy {
        reason: String,
        blocked_until: Option<chrono::DateTime<chrono::Utc>>,
    },
    /// No plan could be produced by any reasoning strategy. Terminal.
    Reasoning(String),
    /// Timeout, connection error, or agent-reported failure.
    Transport(String),
    /// Response failed validation after exhausting retries.
    Validation(String),
    /// Detected at startup; aborts initialization.
    Configuration(String),
    /// Unexpected failure in the controller.
    Internal(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::Security(msg) => write!(f, "security error: {}", msg),
            OrchestratorError::Policy { reason, .. } => write!(f, "policy denied: {}", reason),
            OrchestratorError::Reasoning(msg) => write!(f, "reasoning error: {}", msg),
            OrchestratorError::Transport(msg) => write!(f, "transport error: {}", msg),
            OrchestratorError::Validation(msg) => write!(f, "validation error: {}", msg),
            OrchestratorError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            OrchestratorError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for OrchestratorError {}

impl From<reqwest::Error> for OrchestratorError {
    fn from(e: reqwest::Error) -> Self {
        OrchestratorError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Internal(format!("json error: {}", e))
    }
}

impl From<toml::de::Error> for OrchestratorError {
    fn from(e: toml::de::Error) -> Self {
        OrchestratorError::Configuration(e.to_string())
    }
}

/// Classify whether an error message represents a retryable transport failure.
///
/// Based on substring matching against error text, mirroring the source's
/// string-based classification, augmented with typed checks where the caller
/// already knows the kind (timeout vs. connection).
pub fn is_retryable_text(message: &str, retry_on_timeout: bool, retry_on_connection: bool) -> bool {
    let lower = message.to_lowercase();
    (retry_on_timeout && lower.contains("timeout")) || (retry_on_connection && lower.contains("connection"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_text_matches_timeout() {
        assert!(is_retryable_text("request timeout after 30s", true, true));
        assert!(!is_retryable_text("request timeout after 30s", false, true));
    }

    #[test]
    fn retryable_text_matches_connection() {
        assert!(is_retryable_text("connection refused", true, true));
        assert!(!is_retryable_text("connection refused", true, false));
    }

    #[test]
    fn retryable_text_rejects_unknown() {
        assert!(!is_retryable_text("invalid parameters", true, true));
    }

    #[test]
    fn display_does_not_leak_debug_internals() {
        let err = OrchestratorError::Security("prompt injection detected".to_string());
        assert_eq!(err.to_string(), "security error: prompt injection detected");
    }
}
