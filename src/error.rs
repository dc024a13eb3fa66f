//! Error types for the chat router.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Failure to load a rule set from its declarative source.
///
/// Only ever raised by `load`/`reload`. A live resolution never sees one.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Rules file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Error parsing rules from {source_name}: {reason}")]
    Parse { source_name: String, reason: String },

    #[error("{}", validation_message(rule_id.as_deref(), reason))]
    Validation {
        rule_id: Option<String>,
        reason: String,
    },

    #[error("IO error reading rules: {0}")]
    Io(#[from] std::io::Error),
}

impl LoadError {
    /// Validation failure attributed to a specific rule.
    pub fn invalid_rule(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            rule_id: Some(rule_id.into()),
            reason: reason.into(),
        }
    }

    /// ID of the offending rule, when the failure is attributable to one.
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            Self::Validation { rule_id, .. } => rule_id.as_deref(),
            _ => None,
        }
    }
}

fn validation_message(rule_id: Option<&str>, reason: &str) -> String {
    match rule_id {
        Some(id) => format!("Validation error in rule '{id}': {reason}"),
        None => format!("Validation error: {reason}"),
    }
}

/// Failure while judging whether one rule matches a message.
///
/// Absorbed by the resolver: the rule counts as not matched.
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("No match judge configured for free-text condition")]
    JudgeUnavailable,

    #[error("Match judge failed: {0}")]
    JudgeFailed(String),

    #[error("Match judge timed out after {0:?}")]
    Timeout(Duration),
}

/// An externally produced decision that could not be read at all.
#[derive(Debug, thiserror::Error)]
pub enum DecisionParseError {
    #[error("Decision output is empty")]
    Empty,

    #[error("Decision is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure while executing a resolved decision.
///
/// Absorbed by the dispatcher and turned into a single apology message.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Forward to {destination} failed")]
    Forward { destination: String },

    #[error("Answer generation failed: {0}")]
    Generation(#[from] LlmError),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Send failed: {0}")]
    Send(#[from] ChannelError),
}

/// Knowledge-base lookup failure. Answer assembly degrades to "no context".
#[derive(Debug, thiserror::Error)]
#[error("Context retrieval failed: {0}")]
pub struct RetrievalError(pub String);

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_names_rule() {
        let err = LoadError::invalid_rule("DUP", "duplicate rule_id");
        assert_eq!(err.rule_id(), Some("DUP"));
        assert!(err.to_string().contains("'DUP'"));
        assert!(err.to_string().contains("duplicate rule_id"));
    }

    #[test]
    fn validation_error_without_rule() {
        let err = LoadError::Validation {
            rule_id: None,
            reason: "rule entry is not a mapping".into(),
        };
        assert_eq!(err.rule_id(), None);
        assert_eq!(err.to_string(), "Validation error: rule entry is not a mapping");
    }

    #[test]
    fn not_found_mentions_path() {
        let err = LoadError::NotFound {
            path: PathBuf::from("missing/rules.yaml"),
        };
        assert!(err.to_string().contains("missing/rules.yaml"));
        assert_eq!(err.rule_id(), None);
    }
}
