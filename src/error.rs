//! Error types for the proxy.

use std::fmt;

use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving a connection.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed key material or cipher failure
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Malformed or incomplete handshake, or unreachable endpoint
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Deadline exceeded
    #[error("connection timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Admission policy refused the client
    #[error("connection rejected: {0}")]
    Rejected(RejectReason),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Session was cancelled by an operator or by shutdown
    #[error("session cancelled")]
    Cancelled,
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Build a timeout error from a duration.
    pub fn timeout(after: std::time::Duration) -> Self {
        Error::Timeout(after.as_millis() as u64)
    }

    /// Check if this error came from the admission policy
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }

    /// Check if a deadline was exceeded
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Check if the handshake or endpoint selection failed
    pub fn is_protocol_failure(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Why the admission policy refused a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// IP is on the deny list
    Blocklisted,
    /// Allow list is active and the IP is not on it
    NotWhitelisted,
    /// Client record was flagged as blocked earlier
    Blocked(String),
    /// Too many concurrent connections from this IP
    TooManyConnections,
    /// Connection rate exceeded inside the current window
    RateLimitExceeded,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Blocklisted => f.write_str("in blocklist"),
            RejectReason::NotWhitelisted => f.write_str("not in whitelist"),
            RejectReason::Blocked(reason) => f.write_str(reason),
            RejectReason::TooManyConnections => f.write_str("rate limited"),
            RejectReason::RateLimitExceeded => f.write_str("rate limit exceeded"),
        }
    }
}

impl From<RejectReason> for Error {
    fn from(reason: RejectReason) -> Self {
        Error::Rejected(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Timeout(5000);
        assert_eq!(err.to_string(), "connection timeout after 5000ms");

        let err = Error::from(RejectReason::NotWhitelisted);
        assert_eq!(err.to_string(), "connection rejected: not in whitelist");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::from(RejectReason::Blocklisted).is_policy_rejection());
        assert!(Error::timeout(std::time::Duration::from_secs(10)).is_timeout());
        assert!(Error::protocol("short preamble").is_protocol_failure());
        assert!(!Error::timeout(std::time::Duration::from_secs(1)).is_protocol_failure());
        assert!(!Error::config("bad port").is_protocol_failure());
        assert!(!Error::crypto("bad key").is_policy_rejection());
    }

    #[test]
    fn test_reject_reason_display() {
        assert_eq!(RejectReason::TooManyConnections.to_string(), "rate limited");
        assert_eq!(
            RejectReason::Blocked("manual ban".into()).to_string(),
            "manual ban"
        );
    }
}
