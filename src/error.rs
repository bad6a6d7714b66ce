//! Error types for the alerting pipeline

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur anywhere in the ingest → channel → evaluation pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Device identifier is not a six-octet colon-separated MAC address
    #[error("Invalid device identifier: '{0}'")]
    InvalidIdentifier(String),

    /// Classification/authorization store is unreachable
    ///
    /// `retry_after` is set while the connection is backing off.
    #[error("Device directory unavailable: {reason}")]
    DirectoryUnavailable {
        reason: String,
        retry_after: Option<Duration>,
    },

    /// Channel connection failure
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Publish failure
    #[error("Failed to publish envelope to subject '{subject}': {reason}")]
    Publish {
        subject: String,
        reason: String,
    },

    /// Consumer/subscription creation or pull failure
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Event or alert write/read failure
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Rule evaluation failed on a malformed envelope
    #[error("Evaluation failed for event type '{event_type}': {reason}")]
    Evaluation {
        event_type: String,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl PipelineError {
    /// Whether the failure is transient and the operation may succeed if retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::DirectoryUnavailable { .. }
                | PipelineError::ChannelUnavailable(_)
                | PipelineError::Publish { .. }
                | PipelineError::Consumer(_)
                | PipelineError::Ack(_)
                | PipelineError::Persistence(_)
                | PipelineError::Timeout(_)
        )
    }

    /// Whether the failure is a rejected device identifier
    pub fn is_invalid_identifier(&self) -> bool {
        matches!(self, PipelineError::InvalidIdentifier(_))
    }

    pub(crate) fn directory(reason: impl Into<String>) -> Self {
        PipelineError::DirectoryUnavailable {
            reason: reason.into(),
            retry_after: None,
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Persistence(e.to_string())
    }
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PipelineError::directory("down").is_retryable());
        assert!(PipelineError::Persistence("deadlock".into()).is_retryable());
        assert!(PipelineError::ChannelUnavailable("refused".into()).is_retryable());

        assert!(!PipelineError::InvalidIdentifier("zz".into()).is_retryable());
        assert!(!PipelineError::Evaluation {
            event_type: "speed_violation".into(),
            reason: "not a number".into(),
        }
        .is_retryable());
        assert!(!PipelineError::Config("missing".into()).is_retryable());
    }

    #[test]
    fn test_invalid_identifier_is_distinguishable() {
        let err = PipelineError::InvalidIdentifier("AA:BB".into());
        assert!(err.is_invalid_identifier());
        assert_eq!(err.to_string(), "Invalid device identifier: 'AA:BB'");
        assert!(!PipelineError::Timeout("x".into()).is_invalid_identifier());
    }
}
