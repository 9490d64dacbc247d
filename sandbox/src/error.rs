use std::time::Duration;

use crate::types::SandboxStatus;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A global or per-sandbox cap would be exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Storage allocation or runtime materialization failed.
    #[error("environment creation failed: {0}")]
    EnvironmentCreation(String),

    /// Even the weakest isolation level could not be set up.
    #[error("isolation failed: {0}")]
    Isolation(String),

    /// Teardown failed without `force`.
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sandbox {id} is {status}")]
    InvalidState { id: String, status: SandboxStatus },

    #[error("backend not available: {0}")]
    BackendNotAvailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Self::ResourceExhausted(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_uses_millis() {
        let err = SandboxError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "operation timed out after 1500ms");
    }

    #[test]
    fn invalid_state_names_status() {
        let err = SandboxError::InvalidState {
            id: "sbx-1".into(),
            status: SandboxStatus::Destroyed,
        };
        assert_eq!(err.to_string(), "sandbox sbx-1 is destroyed");
    }

    #[test]
    fn predicates_match_variants() {
        assert!(SandboxError::ResourceExhausted("cap".into()).is_resource_exhausted());
        assert!(SandboxError::NotFound("x".into()).is_not_found());
        assert!(!SandboxError::Cleanup("x".into()).is_not_found());
    }
}
