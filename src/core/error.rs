use crate::core::types::{IntentId, IntentStatus};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Intent '{0}' not found")]
    NotFound(IntentId),

    #[error("Intent '{0}' already exists")]
    AlreadyExists(IntentId),

    #[error("Could not acquire lock on intent '{intent_id}' within {timeout_ms}ms")]
    LockTimeout { intent_id: IntentId, timeout_ms: u64 },

    #[error("Deadlock detected while locking intent '{intent_id}' (attempts: {attempts})")]
    Deadlock { intent_id: IntentId, attempts: u32 },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidStatus { from: IntentStatus, to: IntentStatus },

    #[error("Diff validation error: {0}")]
    DiffValidation(String),

    #[error("Diff application error: {0}")]
    DiffApplication(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Source '{0}' is not authorized for re-evaluation")]
    UnauthorizedSource(String),

    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn stage(stage: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// Returns `true` for lock-wait cycles reported by the storage layer.
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }

    /// Re-labels a deadlock with the number of attempts spent on it.
    pub(crate) fn with_attempts(self, attempts: u32) -> Self {
        match self {
            Self::Deadlock { intent_id, .. } => Self::Deadlock {
                intent_id,
                attempts,
            },
            other => other,
        }
    }

    /// Classifies the error for the layer that turns it into a response.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::LockTimeout { .. } => ErrorClass::TryLater,
            Self::Deadlock { .. } | Self::AlreadyExists(_) | Self::InvalidStatus { .. } => {
                ErrorClass::Conflict
            }
            Self::DiffValidation(_) | Self::DiffApplication(_) | Self::InvalidValue(_) => {
                ErrorClass::BadRequest
            }
            Self::UnauthorizedSource(_) => ErrorClass::Forbidden,
            Self::Stage { .. } | Self::Config(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorClass::Internal
            }
        }
    }
}

/// Coarse outcome classes an API layer maps errors onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NotFound,
    /// Lock could not be acquired in time; nothing changed.
    TryLater,
    Conflict,
    BadRequest,
    Forbidden,
    Internal,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotFound => "not_found",
            Self::TryLater => "try_later",
            Self::Conflict => "conflict",
            Self::BadRequest => "bad_request",
            Self::Forbidden => "forbidden",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

impl<T> From<std::sync::PoisonError<T>> for BridgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let id = IntentId::new();
        assert_eq!(
            BridgeError::LockTimeout {
                intent_id: id,
                timeout_ms: 5
            }
            .class(),
            ErrorClass::TryLater
        );
        assert_eq!(
            BridgeError::Deadlock {
                intent_id: id,
                attempts: 3
            }
            .class(),
            ErrorClass::Conflict
        );
        assert_eq!(
            BridgeError::DiffValidation("bad".into()).class(),
            ErrorClass::BadRequest
        );
        assert_eq!(BridgeError::NotFound(id).class(), ErrorClass::NotFound);
    }

    #[test]
    fn test_with_attempts_only_touches_deadlocks() {
        let id = IntentId::new();
        let err = BridgeError::Deadlock {
            intent_id: id,
            attempts: 1,
        }
        .with_attempts(4);
        assert!(matches!(err, BridgeError::Deadlock { attempts: 4, .. }));

        let err = BridgeError::NotFound(id).with_attempts(4);
        assert!(matches!(err, BridgeError::NotFound(_)));
    }
}
