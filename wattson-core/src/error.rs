//! The abstract error taxonomy of the control plane (spec §7).
//!
//! Handlers return `Result<Option<Response>, WattsonError>`. The router (see
//! [`crate::router`]) catches the `Err` variant and turns it into a failure
//! [`Response`](crate::message::Response) carrying `{error: string}`, without
//! ever propagating a panic out of a single handler's misbehavior.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A coarse classification of why a request failed.
///
/// This mirrors the abstract taxonomy of spec §7: it exists so that clients
/// which want to branch on the *kind* of failure (rather than just display
/// the message) can do so without parsing the error string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No handler in the chain claimed the query type.
    Unhandled,
    /// The payload was malformed, or referenced an entity that does not exist.
    Invalid,
    /// A write was refused because the target is locked and `override` was not set.
    Locked,
    /// The operation exceeded its configured time budget.
    Timeout,
    /// The underlying socket closed mid-request, or a frame failed to (de)serialize.
    TransportError,
    /// A handler raised an unexpected error; the message carries its `Display` text.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::Unhandled => "UNHANDLED",
            ErrorCode::Invalid => "INVALID",
            ErrorCode::Locked => "LOCKED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::TransportError => "TRANSPORT_ERROR",
            ErrorCode::Internal => "INTERNAL",
        };
        f.write_str(s)
    }
}

/// The error type produced by control-plane handlers and transport code.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{code}: {message}")]
pub struct WattsonError {
    /// The coarse classification of the failure.
    pub code: ErrorCode,
    /// A human-readable description, suitable for the wire-level `{error:
    /// string}` payload of spec §6.2.
    pub message: String,
}

impl WattsonError {
    /// Builds a new error of the given code with a message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for [`ErrorCode::Unhandled`].
    pub fn unhandled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unhandled, message)
    }

    /// Shorthand for [`ErrorCode::Invalid`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Invalid, message)
    }

    /// Shorthand for [`ErrorCode::Locked`].
    pub fn locked(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Locked, message)
    }

    /// Shorthand for [`ErrorCode::Timeout`].
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Shorthand for [`ErrorCode::TransportError`].
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportError, message)
    }

    /// Shorthand for [`ErrorCode::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WattsonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = WattsonError::locked("value bus.1.CONFIGURATION.voltage_setpoint is locked");
        let rendered = err.to_string();
        assert!(rendered.starts_with("LOCKED:"));
        assert!(rendered.contains("voltage_setpoint"));
    }
}
