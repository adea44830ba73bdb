//! Error types for the conduit-connect crate

use conduit_core_pending::{Status, StatusCode};
use thiserror::Error;

/// Failures reported by a transport implementation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Bind rejected: {0}")]
    BindRejected(String),

    #[error("Link closed: {0}")]
    LinkClosed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&TransportError> for Status {
    fn from(err: &TransportError) -> Self {
        match err {
            TransportError::ProviderNotFound(_) => Status::provider_unavailable(err.to_string()),
            TransportError::BindRejected(_) => Status::connection_failed(err.to_string()),
            TransportError::LinkClosed(_) | TransportError::Io(_) => {
                Status::disconnected(err.to_string())
            }
        }
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        Status::from(&err)
    }
}

/// Errors raised while resolving or managing connections
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("No provider registered for API '{0}'")]
    ProviderUnavailable(String),

    #[error("Provider factory for API '{api}' failed: {source}")]
    Factory {
        api: String,
        #[source]
        source: TransportError,
    },

    #[error("Registry is shut down")]
    ShutDown,
}

impl From<ConnectError> for Status {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::ProviderUnavailable(_) => Status::provider_unavailable(err.to_string()),
            ConnectError::Factory { ref source, .. } => {
                Status::from(source).with_message(err.to_string())
            }
            ConnectError::ShutDown => Status::cancelled().with_message(err.to_string()),
        }
    }
}

/// Failure raised by a deferred call while it runs against a connection
///
/// Carries the status the call's result is resolved with.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{status}")]
pub struct CallError {
    status: Status,
}

impl CallError {
    pub fn new(status: Status) -> Self {
        Self { status }
    }

    /// A provider-reported failure
    pub fn remote(code: i32, message: impl Into<String>) -> Self {
        Self::new(Status::remote(code, message))
    }

    /// Arguments or replies that could not be encoded or decoded locally
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Status::internal(message))
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn code(&self) -> StatusCode {
        self.status.code()
    }
}

impl From<Status> for CallError {
    fn from(status: Status) -> Self {
        Self::new(status)
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        Self::new(err.into())
    }
}

impl From<CallError> for Status {
    fn from(err: CallError) -> Self {
        err.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_status_mapping() {
        let cases = [
            (
                TransportError::ProviderNotFound("maps".into()),
                StatusCode::ProviderUnavailable,
            ),
            (
                TransportError::BindRejected("denied".into()),
                StatusCode::ConnectionFailed,
            ),
            (
                TransportError::LinkClosed("peer exited".into()),
                StatusCode::Disconnected,
            ),
            (
                TransportError::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)),
                StatusCode::Disconnected,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(Status::from(err).code(), expected);
        }
    }

    #[test]
    fn test_connect_error_status_mapping() {
        let status: Status = ConnectError::ProviderUnavailable("safety".into()).into();
        assert_eq!(status.code(), StatusCode::ProviderUnavailable);
        assert!(status.message().unwrap().contains("safety"));

        let status: Status = ConnectError::Factory {
            api: "location".into(),
            source: TransportError::BindRejected("no permission".into()),
        }
        .into();
        assert_eq!(status.code(), StatusCode::ConnectionFailed);
    }

    #[test]
    fn test_call_error_roundtrip() {
        let err = CallError::remote(13, "bad argument");
        assert_eq!(err.code(), StatusCode::RemoteError);
        let status: Status = err.clone().into();
        assert_eq!(status.remote_code(), Some(13));
        assert_eq!(err.to_string(), status.to_string());
    }
}
