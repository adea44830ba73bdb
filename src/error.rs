/*!
 * Error types for Conduit
 */

use conduit_connect::ConnectError;
use conduit_core_pending::{DispatchError, Status, StatusCode};
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConduitError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_CALL_FAILED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum ConduitError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection could not be resolved
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    /// Execution context could not be set up
    #[error("Dispatcher error: {0}")]
    Dispatch(#[from] DispatchError),

    /// A call resolved with a failure status
    #[error("Call failed: {0}")]
    Call(Status),

    /// The host was shut down
    #[error("Client host is shut down")]
    ShutDown,
}

impl ConduitError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ConduitError::Config(_) | ConduitError::Io(_) | ConduitError::Dispatch(_) => {
                EXIT_FATAL
            }
            ConduitError::Connect(_) | ConduitError::Call(_) | ConduitError::ShutDown => {
                EXIT_CALL_FAILED
            }
        }
    }

    /// Status a caller would see for this error
    pub fn status(&self) -> Status {
        match self {
            ConduitError::Call(status) => status.clone(),
            ConduitError::Connect(ConnectError::ProviderUnavailable(_)) => {
                Status::provider_unavailable(self.to_string())
            }
            ConduitError::ShutDown => Status::cancelled().with_message(self.to_string()),
            _ => Status::internal(self.to_string()),
        }
    }

    /// A timed-out wait is worth repeating; everything else is final
    pub fn is_transient(&self) -> bool {
        matches!(self, ConduitError::Call(status) if status.code() == StatusCode::Timeout)
    }
}

impl From<Status> for ConduitError {
    fn from(status: Status) -> Self {
        ConduitError::Call(status)
    }
}

impl From<toml::de::Error> for ConduitError {
    fn from(err: toml::de::Error) -> Self {
        ConduitError::Config(format!("Invalid configuration file: {}", err))
    }
}

impl From<toml::ser::Error> for ConduitError {
    fn from(err: toml::ser::Error) -> Self {
        ConduitError::Config(format!("Failed to serialize configuration: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(ConduitError::Config("bad".into()).exit_code(), EXIT_FATAL);
        assert_eq!(
            ConduitError::Io(io::Error::other("disk")).exit_code(),
            EXIT_FATAL
        );
        assert_eq!(
            ConduitError::Call(Status::disconnected("gone")).exit_code(),
            EXIT_CALL_FAILED
        );
        assert_eq!(
            ConduitError::Connect(ConnectError::ProviderUnavailable("x".into())).exit_code(),
            EXIT_CALL_FAILED
        );
        assert_eq!(ConduitError::ShutDown.exit_code(), EXIT_CALL_FAILED);
    }

    #[test]
    fn test_exit_code_constants() {
        assert_eq!(EXIT_SUCCESS, 0);
        assert_ne!(EXIT_CALL_FAILED, EXIT_FATAL);
    }

    #[test]
    fn test_status_mapping() {
        let err = ConduitError::Call(Status::remote(3, "denied"));
        assert_eq!(err.status().remote_code(), Some(3));

        let err = ConduitError::Connect(ConnectError::ProviderUnavailable("maps".into()));
        assert_eq!(err.status().code(), StatusCode::ProviderUnavailable);

        assert_eq!(
            ConduitError::Config("x".into()).status().code(),
            StatusCode::Internal
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(ConduitError::Call(Status::timeout()).is_transient());
        assert!(!ConduitError::Call(Status::cancelled()).is_transient());
        assert!(!ConduitError::ShutDown.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ConduitError::Call(Status::connection_failed("bind refused"));
        assert_eq!(
            err.to_string(),
            "Call failed: CONNECTION_FAILED(17): bind refused"
        );
    }
}
