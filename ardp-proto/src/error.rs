//! Error types for ARDP protocol operations.

use thiserror::Error;

/// ARDP protocol errors.
///
/// The taxonomy is deliberately flat: every fallible operation in the engine
/// resolves to one of these, and callbacks receive them as the `status` of a
/// completion.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArdpError {
    /// Socket transient; recover by deferring to the next `run` cycle.
    #[error("operation would block")]
    WouldBlock,

    /// Local or remote send window is full; retry after the window reopens.
    #[error("send window full")]
    BackPressure,

    /// The message's time-to-live elapsed before its first transmission.
    #[error("message expired before transmission")]
    TtlExpired,

    /// The API call is not valid in the connection's current state.
    #[error("invalid connection state")]
    InvalidState,

    /// Malformed inbound segment or invalid argument.
    #[error("invalid segment or argument")]
    InvalidData,

    /// Buffer ring sizing failed during connect/accept.
    #[error("buffer ring allocation failed")]
    OutOfMemory,

    /// Generic socket-level failure; escalates to a disconnect.
    #[error("transport failure")]
    Fail,
}

/// Result type alias for ARDP operations.
pub type Result<T> = core::result::Result<T, ArdpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(ArdpError::WouldBlock.to_string(), "operation would block");
        assert_eq!(ArdpError::BackPressure.to_string(), "send window full");
        assert_eq!(
            ArdpError::TtlExpired.to_string(),
            "message expired before transmission"
        );
    }

    #[test]
    fn test_error_eq() {
        assert_eq!(ArdpError::Fail, ArdpError::Fail);
        assert_ne!(ArdpError::Fail, ArdpError::InvalidState);
    }
}
