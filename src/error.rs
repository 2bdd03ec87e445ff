//! Error types for the handoff runtime

use thiserror::Error;

/// Result type alias for the handoff runtime
pub type Result<T> = std::result::Result<T, HandoffError>;

/// Main error type for the handoff runtime
///
/// Rate-limit and circular-window hits are not errors. They are regular
/// blocked decisions and never appear here.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Candidate failed structural validation
    #[error("Invalid candidate: {message}")]
    InvalidCandidate { message: String },

    /// Another holder owns the conversation lock (retryable)
    #[error("Lock contention on conversation {conversation_id}")]
    LockContention { conversation_id: String },

    /// Lock could not be acquired within the attempt budget
    #[error("Lock unavailable for conversation {conversation_id} after {attempts} attempts")]
    LockUnavailable {
        conversation_id: String,
        attempts: usize,
    },

    /// Backing store rejected or lost a read/write
    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded or parsed
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Store backend unavailable or misbehaving
    #[error("Backend error: {0}")]
    Backend(String),
}

impl HandoffError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Contention clears when the holder releases; persistence and backend
    /// failures are often transient. Validation never is.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            HandoffError::LockContention { .. }
                | HandoffError::Persistence(_)
                | HandoffError::Backend(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HandoffError::InvalidCandidate {
            message: "source and target roles are equal".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid candidate: source and target roles are equal"
        );

        let err = HandoffError::LockUnavailable {
            conversation_id: "conv-1".to_string(),
            attempts: 3,
        };
        assert_eq!(
            err.to_string(),
            "Lock unavailable for conversation conv-1 after 3 attempts"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(HandoffError::LockContention {
            conversation_id: "conv-1".to_string()
        }
        .retryable());
        assert!(HandoffError::Backend("connection reset".to_string()).retryable());
        assert!(!HandoffError::InvalidCandidate {
            message: "bad".to_string()
        }
        .retryable());
        assert!(!HandoffError::LockUnavailable {
            conversation_id: "conv-1".to_string(),
            attempts: 3
        }
        .retryable());
    }

    #[test]
    fn test_result_type() {
        fn example_function() -> Result<String> {
            Ok("success".to_string())
        }

        let result = example_function();
        assert!(result.is_ok());
        assert_eq!(result.unwrap(), "success");
    }
}
