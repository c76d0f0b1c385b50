//! Error types for sf-core
//!
//! Re-exports the shared error crate and maps errors to and from the
//! helper's wire error codes.

pub use sf_error::{ErrorClass, Result, SmcError};
use sf_protocol::ErrorCode;

/// Wire code for an error raised inside the helper.
pub fn to_wire(err: &SmcError) -> ErrorCode {
    match err {
        SmcError::ServiceNotFound(_) => ErrorCode::ServiceNotFound,
        SmcError::ConnectionFailed(_) | SmcError::Io(_) | SmcError::Timeout(_) => {
            ErrorCode::ConnectionFailed
        }
        SmcError::NotConnected => ErrorCode::NotConnected,
        SmcError::ReadFailed { .. } => ErrorCode::ReadFailed,
        SmcError::WriteFailed { .. } => ErrorCode::WriteFailed,
        SmcError::PermissionDenied(_) => ErrorCode::PermissionDenied,
        SmcError::Restricted(_) => ErrorCode::Restricted,
        SmcError::FanSpeedOutOfRange { .. }
        | SmcError::InvalidFanIndex { .. }
        | SmcError::ValueOutOfRange(_) => ErrorCode::ValueOutOfRange,
        SmcError::MalformedRecord { .. } | SmcError::MalformedReply(_) => ErrorCode::MalformedRecord,
        SmcError::InvalidKey(_)
        | SmcError::UnsupportedFormat(_)
        | SmcError::IpcProtocol(_)
        | SmcError::MessageTooLarge { .. }
        | SmcError::JsonParse(_)
        | SmcError::Config(_) => ErrorCode::InvalidRequest,
        SmcError::RateLimited(_) => ErrorCode::RateLimited,
        SmcError::PoolExhausted { .. } | SmcError::HelperResponse(_) | SmcError::Generic(_) => {
            ErrorCode::Internal
        }
    }
}

/// Rebuild an error from a helper reply.
///
/// `subject` names what the request was about (a key, a fan) and fills the
/// key field of read/write failures.
pub fn from_wire(code: ErrorCode, message: String, subject: &str) -> SmcError {
    match code {
        ErrorCode::ServiceNotFound => SmcError::ServiceNotFound(message),
        ErrorCode::ConnectionFailed => SmcError::ConnectionFailed(message),
        ErrorCode::NotConnected => SmcError::NotConnected,
        ErrorCode::ReadFailed => SmcError::read_failed(subject, message),
        ErrorCode::WriteFailed => SmcError::write_failed(subject, message),
        ErrorCode::PermissionDenied => SmcError::PermissionDenied(message),
        ErrorCode::Restricted => SmcError::Restricted(message),
        ErrorCode::RateLimited => SmcError::RateLimited(message),
        ErrorCode::InvalidRequest => SmcError::IpcProtocol(message),
        ErrorCode::ValueOutOfRange => SmcError::ValueOutOfRange(message),
        ErrorCode::MalformedRecord => SmcError::MalformedReply(message),
        ErrorCode::Internal => SmcError::HelperResponse(format!("{}: {}", code, message)),
    }
}
