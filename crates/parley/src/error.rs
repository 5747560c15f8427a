//! Unified error type for Parley.

use parley_protocol::{ErrorInfo, ProtocolError};
use parley_room::RoomError;
use parley_scheduler::SchedulerError;
use parley_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// When using the `parley` crate you deal with this single error type
/// instead of importing errors from each sub-crate. The `#[from]`
/// attribute on each variant generates the `From` impls, so `?` converts
/// sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// A channel-level error (attach, detach, publish).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A lifecycle operation was cancelled or panicked.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A room-level error (lifecycle, options, disabled feature).
    #[error(transparent)]
    Room(#[from] RoomError),

    /// Client options could not be parsed.
    #[error("invalid client options: {0}")]
    Options(#[from] serde_json::Error),
}

impl ChatError {
    /// The coded error behind this failure, if it carries one.
    pub fn info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Room(e) => e.info(),
            Self::Transport(e) => e.reason(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::ErrorCode;

    use super::*;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::Released("lobby::$chat::$chatMessages".into());
        let chat_err: ChatError = err.into();
        assert!(matches!(chat_err, ChatError::Transport(_)));
        assert!(chat_err.to_string().contains("lobby"));
    }

    #[test]
    fn test_from_protocol_error() {
        let err = ProtocolError::InvalidEvent("no serial".into());
        let chat_err: ChatError = err.into();
        assert!(matches!(chat_err, ChatError::Protocol(_)));
    }

    #[test]
    fn test_from_scheduler_error() {
        let err = SchedulerError::Cancelled("attach".into());
        let chat_err: ChatError = err.into();
        assert!(matches!(chat_err, ChatError::Scheduler(_)));
    }

    #[test]
    fn test_from_room_error_keeps_code() {
        let err = RoomError::Lifecycle(ErrorCode::RoomIsReleased.info("released"));
        let chat_err: ChatError = err.into();
        assert!(matches!(chat_err, ChatError::Room(_)));
        assert_eq!(chat_err.info().map(|i| i.code), Some(102103));
    }
}
