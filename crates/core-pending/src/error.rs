//! Error types for pending results and dispatchers

use crate::status::Status;
use thiserror::Error;

/// Rejected attempt to complete a pending result
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompletionError {
    /// The result was already resolved; the stored outcome is unchanged
    #[error("pending result was already completed")]
    AlreadyCompleted,

    /// The result was cancelled; the outcome is discarded
    #[error("pending result was cancelled")]
    Cancelled,
}

impl CompletionError {
    /// Only a double completion is a framework bug; completing a cancelled
    /// result is an expected race with the caller.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, CompletionError::AlreadyCompleted)
    }
}

impl From<CompletionError> for Status {
    fn from(err: CompletionError) -> Self {
        match err {
            CompletionError::AlreadyCompleted => Status::internal(err.to_string()),
            CompletionError::Cancelled => Status::cancelled(),
        }
    }
}

/// Errors raised while setting up or feeding a dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The worker thread could not be started
    #[error("failed to spawn dispatcher worker '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The dispatcher was shut down and no longer accepts jobs
    #[error("dispatcher '{0}' is shut down")]
    ShutDown(String),
}

impl From<DispatchError> for Status {
    fn from(err: DispatchError) -> Self {
        Status::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn test_double_completion_maps_to_internal() {
        let status: Status = CompletionError::AlreadyCompleted.into();
        assert_eq!(status.code(), StatusCode::Internal);
        assert!(CompletionError::AlreadyCompleted.is_contract_violation());
    }

    #[test]
    fn test_cancelled_completion_is_not_a_bug() {
        let status: Status = CompletionError::Cancelled.into();
        assert_eq!(status.code(), StatusCode::Cancelled);
        assert!(!CompletionError::Cancelled.is_contract_violation());
    }
}
