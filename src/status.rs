//! Uniform status taxonomy for the session boundary.
//!
//! Component failures (HTTP, crypto, tunnel, datapath) are converted to
//! a [`Status`] before they cross into the session state machine so the
//! reattempt and reconnect policies can classify them uniformly. The
//! code set mirrors the canonical RPC codes the backends speak.

use std::fmt;
use thiserror::Error;

/// Canonical status codes used at the session boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// Unclassified internal failure.
    Internal,
    /// Transient transport-level failure (DNS, I/O, HTTP 5xx).
    Unavailable,
    /// HTTP 401. The OAuth token must be cleared before retrying.
    Unauthenticated,
    /// HTTP 403. Permanent.
    PermissionDenied,
    /// Malformed response or bad configuration.
    InvalidArgument,
    /// Operation attempted in a state that cannot accept it.
    FailedPrecondition,
    /// A deadline elapsed before the operation completed.
    DeadlineExceeded,
    /// A required resource was absent.
    NotFound,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::Unauthenticated => "unauthenticated",
            Code::PermissionDenied => "permission denied",
            Code::InvalidArgument => "invalid argument",
            Code::FailedPrecondition => "failed precondition",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::NotFound => "not found",
        };
        write!(f, "{}", s)
    }
}

/// Machine-readable detail attached to a [`Status`].
///
/// Carried separately from the code because the same code can be
/// permanent or retryable depending on the detail (a tunnel-create
/// `FailedPrecondition` is permanent only when the VPN permission was
/// revoked by the user).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusDetail {
    /// The OS-level VPN permission was revoked.
    VpnPermissionRevoked,
}

/// A status: code, human-readable message, optional detail.
#[derive(Clone, Debug, Error)]
#[error("{code}: {message}")]
pub struct Status {
    code: Code,
    message: String,
    detail: Option<StatusDetail>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    /// Attach a machine-readable detail.
    pub fn with_detail(mut self, detail: StatusDetail) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<StatusDetail> {
        self.detail
    }

    /// Whether this status should terminate the engine rather than be
    /// retried: permission denial, or a revoked VPN permission.
    pub fn is_permanent(&self) -> bool {
        self.code == Code::PermissionDenied
            || self.detail == Some(StatusDetail::VpnPermissionRevoked)
    }

    /// Map an HTTP response code onto the status taxonomy.
    pub fn from_http(code: u16, message: impl Into<String>) -> Self {
        let status_code = match code {
            400 => Code::InvalidArgument,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::NotFound,
            408 | 504 => Code::DeadlineExceeded,
            500..=599 => Code::Unavailable,
            _ => Code::Internal,
        };
        Self::new(status_code, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_mapping() {
        assert_eq!(Status::from_http(401, "").code(), Code::Unauthenticated);
        assert_eq!(Status::from_http(403, "").code(), Code::PermissionDenied);
        assert_eq!(Status::from_http(500, "").code(), Code::Unavailable);
        assert_eq!(Status::from_http(503, "").code(), Code::Unavailable);
        assert_eq!(Status::from_http(400, "").code(), Code::InvalidArgument);
        assert_eq!(Status::from_http(418, "").code(), Code::Internal);
    }

    #[test]
    fn test_permanence() {
        assert!(Status::permission_denied("forbidden").is_permanent());
        assert!(!Status::unavailable("flaky backend").is_permanent());
        assert!(!Status::failed_precondition("no tunnel").is_permanent());
        assert!(Status::failed_precondition("no tunnel")
            .with_detail(StatusDetail::VpnPermissionRevoked)
            .is_permanent());
    }

    #[test]
    fn test_display() {
        let status = Status::unauthenticated("token expired");
        assert_eq!(status.to_string(), "unauthenticated: token expired");
    }
}
