//! Status values returned by every Conduit operation
//!
//! A `Status` is an immutable success/failure code with an optional message.
//! Integer values follow the common status code numbering used by the
//! provider platform, so codes can travel over a transport unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed taxonomy of outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// The operation succeeded
    Success,
    /// No factory is registered for the API, or the provider is not installed
    ProviderUnavailable,
    /// A local contract violation detected by the framework itself
    Internal,
    /// A caller-side wait elapsed; the result may still arrive later
    Timeout,
    /// The caller cancelled the result before it resolved
    Cancelled,
    /// The transport rejected the bind attempt
    ConnectionFailed,
    /// The provider executed the call and reported a failure
    RemoteError,
    /// The link dropped while the operation was queued or in flight
    Disconnected,
}

impl StatusCode {
    /// Stable integer value of this code
    pub fn as_i32(self) -> i32 {
        match self {
            StatusCode::Success => 0,
            StatusCode::ProviderUnavailable => 1,
            StatusCode::Internal => 8,
            StatusCode::Timeout => 15,
            StatusCode::Cancelled => 16,
            StatusCode::ConnectionFailed => 17,
            StatusCode::RemoteError => 19,
            StatusCode::Disconnected => 20,
        }
    }

    /// Parse an integer code, `None` for values outside the taxonomy
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(StatusCode::Success),
            1 => Some(StatusCode::ProviderUnavailable),
            8 => Some(StatusCode::Internal),
            15 => Some(StatusCode::Timeout),
            16 => Some(StatusCode::Cancelled),
            17 => Some(StatusCode::ConnectionFailed),
            19 => Some(StatusCode::RemoteError),
            20 => Some(StatusCode::Disconnected),
            _ => None,
        }
    }

    /// Short upper-case name, as used in log lines
    pub fn name(self) -> &'static str {
        match self {
            StatusCode::Success => "SUCCESS",
            StatusCode::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Timeout => "TIMEOUT",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::ConnectionFailed => "CONNECTION_FAILED",
            StatusCode::RemoteError => "REMOTE_ERROR",
            StatusCode::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.as_i32())
    }
}

/// Immutable outcome of an operation
///
/// # Example
/// ```
/// use conduit_core_pending::{Status, StatusCode};
///
/// let status = Status::disconnected("provider process exited");
/// assert_eq!(status.code(), StatusCode::Disconnected);
/// assert!(!status.is_success());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    /// Provider's own status code, only set for `RemoteError`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_code: Option<i32>,
}

impl Status {
    /// Create a status with an optional message
    pub fn new(code: StatusCode, message: Option<String>) -> Self {
        Self {
            code,
            message,
            remote_code: None,
        }
    }

    pub fn success() -> Self {
        Self::new(StatusCode::Success, None)
    }

    pub fn cancelled() -> Self {
        Self::new(StatusCode::Cancelled, None)
    }

    /// The "not ready" answer of a timed-out wait
    pub fn timeout() -> Self {
        Self::new(StatusCode::Timeout, None)
    }

    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ProviderUnavailable, Some(message.into()))
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ConnectionFailed, Some(message.into()))
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Disconnected, Some(message.into()))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, Some(message.into()))
    }

    /// A failure reported by the provider, carrying its own status code
    pub fn remote(remote_code: i32, message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::RemoteError,
            message: Some(message.into()),
            remote_code: Some(remote_code),
        }
    }

    /// Same code with a replacement message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn remote_code(&self) -> Option<i32> {
        self.remote_code
    }

    pub fn is_success(&self) -> bool {
        self.code == StatusCode::Success
    }

    /// True for every failure that ends an operation
    ///
    /// `Timeout` is the only failure that is not terminal: the result it was
    /// reported for may still resolve.
    pub fn is_terminal_failure(&self) -> bool {
        !matches!(self.code, StatusCode::Success | StatusCode::Timeout)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::success()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(remote) = self.remote_code {
            write!(f, " [remote {}]", remote)?;
        }
        if let Some(ref message) = self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [StatusCode; 8] = [
        StatusCode::Success,
        StatusCode::ProviderUnavailable,
        StatusCode::Internal,
        StatusCode::Timeout,
        StatusCode::Cancelled,
        StatusCode::ConnectionFailed,
        StatusCode::RemoteError,
        StatusCode::Disconnected,
    ];

    #[test]
    fn test_integer_codes_are_stable_and_distinct() {
        let mut seen = std::collections::HashSet::new();
        for code in ALL {
            assert!(seen.insert(code.as_i32()), "duplicate value for {:?}", code);
            assert_eq!(StatusCode::from_i32(code.as_i32()), Some(code));
        }
        assert_eq!(StatusCode::Success.as_i32(), 0);
        assert_eq!(StatusCode::from_i32(4242), None);
    }

    #[test]
    fn test_success_only_for_zero() {
        assert!(Status::success().is_success());
        assert!(!Status::cancelled().is_success());
        assert!(!Status::internal("double resolve").is_success());
    }

    #[test]
    fn test_timeout_is_not_terminal() {
        assert!(!Status::timeout().is_terminal_failure());
        assert!(Status::disconnected("gone").is_terminal_failure());
        assert!(!Status::success().is_terminal_failure());
    }

    #[test]
    fn test_remote_carries_provider_code() {
        let status = Status::remote(7, "quota exceeded");
        assert_eq!(status.code(), StatusCode::RemoteError);
        assert_eq!(status.remote_code(), Some(7));
        assert_eq!(status.message(), Some("quota exceeded"));
        assert_eq!(
            status.to_string(),
            "REMOTE_ERROR(19) [remote 7]: quota exceeded"
        );
    }

    #[test]
    fn test_display_without_message() {
        assert_eq!(Status::cancelled().to_string(), "CANCELLED(16)");
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&Status::connection_failed("bind refused")).unwrap();
        assert_eq!(
            json,
            r#"{"code":"connection_failed","message":"bind refused"}"#
        );
        let parsed: Status = serde_json::from_str(r#"{"code":"success"}"#).unwrap();
        assert_eq!(parsed, Status::success());
    }
}
