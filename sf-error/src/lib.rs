//! Unified error handling for smcfan
//!
//! A single error type shared by the helper, the client façade and the CLI.
//! Errors that cross the helper boundary are flattened into an error code plus
//! message by `sf-core`; raw platform return codes never leave the helper.

use std::io;

/// Result type alias using SmcError
pub type Result<T> = std::result::Result<T, SmcError>;

/// Coarse classification consumed by the recovery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Access to the channel was refused (privileges, restrictions).
    Permission,
    /// The channel or the helper could not be reached in time.
    Connectivity,
    /// A read or write on an open channel failed.
    Operation,
    /// The caller passed something invalid; never retried.
    Validation,
    /// Malformed messages or records.
    Protocol,
}

#[derive(thiserror::Error, Debug)]
pub enum SmcError {
    // ============================================================================
    // Channel Errors
    // ============================================================================
    #[error("SMC service not found: {0}")]
    ServiceNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to the SMC channel")]
    NotConnected,

    #[error("Failed to read key {key}: {reason}")]
    ReadFailed {
        key: String,
        reason: String,
    },

    #[error("Failed to write key {key}: {reason}")]
    WriteFailed {
        key: String,
        reason: String,
    },

    #[error("Malformed wire record: expected {expected} bytes, got {actual}")]
    MalformedRecord {
        expected: usize,
        actual: usize,
    },

    /// A malformed record reported by the helper; sizes stay on its side.
    #[error("Malformed SMC reply: {0}")]
    MalformedReply(String),

    // ============================================================================
    // Permission Errors
    // ============================================================================
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Access restricted: {0}")]
    Restricted(String),

    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error("Fan {index} speed {rpm} RPM out of range ({min}-{max} RPM)")]
    FanSpeedOutOfRange {
        index: u8,
        rpm: f64,
        min: f64,
        max: f64,
    },

    #[error("Invalid fan index {index} ({count} fans available)")]
    InvalidFanIndex {
        index: u8,
        count: u8,
    },

    /// Range rejection reported by the helper.
    #[error("Value out of range: {0}")]
    ValueOutOfRange(String),

    #[error("Invalid register key: {0}")]
    InvalidKey(String),

    #[error("Unsupported data format: {0}")]
    UnsupportedFormat(String),

    // ============================================================================
    // Pool and Helper IPC Errors
    // ============================================================================
    #[error("Connection pool exhausted ({max} connections in use)")]
    PoolExhausted {
        max: usize,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Helper response error: {0}")]
    HelperResponse(String),

    #[error("IPC protocol error: {0}")]
    IpcProtocol(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Generic(String),
}

impl SmcError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn read_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReadFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn write_failed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::WriteFailed {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Classify the error for retry/fallback decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::PermissionDenied(_) | Self::Restricted(_) => ErrorClass::Permission,

            Self::ServiceNotFound(_)
            | Self::ConnectionFailed(_)
            | Self::NotConnected
            | Self::Timeout(_)
            | Self::Io(_) => ErrorClass::Connectivity,

            Self::ReadFailed { .. }
            | Self::WriteFailed { .. }
            | Self::HelperResponse(_)
            | Self::PoolExhausted { .. }
            | Self::RateLimited(_)
            | Self::Generic(_) => ErrorClass::Operation,

            Self::FanSpeedOutOfRange { .. }
            | Self::InvalidFanIndex { .. }
            | Self::ValueOutOfRange(_)
            | Self::InvalidKey(_)
            | Self::UnsupportedFormat(_)
            | Self::Config(_) => ErrorClass::Validation,

            Self::MalformedRecord { .. }
            | Self::MalformedReply(_)
            | Self::IpcProtocol(_)
            | Self::MessageTooLarge { .. }
            | Self::JsonParse(_) => ErrorClass::Protocol,
        }
    }

    /// True for errors the caller caused; these are never retried or masked.
    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }
}

impl From<String> for SmcError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

impl From<&str> for SmcError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert_eq!(SmcError::PermissionDenied("x".into()).class(), ErrorClass::Permission);
        assert_eq!(SmcError::ServiceNotFound("x".into()).class(), ErrorClass::Connectivity);
        assert_eq!(SmcError::Timeout("x".into()).class(), ErrorClass::Connectivity);
        assert_eq!(SmcError::read_failed("TC0P", "x").class(), ErrorClass::Operation);
        // local backpressure, not a sign the helper is gone
        assert_eq!(SmcError::PoolExhausted { max: 3 }.class(), ErrorClass::Operation);
        assert_eq!(
            SmcError::MalformedRecord { expected: 80, actual: 53 }.class(),
            ErrorClass::Protocol
        );
        assert!(SmcError::FanSpeedOutOfRange { index: 0, rpm: 200.0, min: 1200.0, max: 6000.0 }
            .is_validation());
    }

    #[test]
    fn test_display_mentions_sizes() {
        let msg = SmcError::MalformedRecord { expected: 80, actual: 53 }.to_string();
        assert!(msg.contains("80"));
        assert!(msg.contains("53"));
    }
}
