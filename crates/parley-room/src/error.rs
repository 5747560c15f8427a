//! Error types for the room layer.

use parley_protocol::{ErrorCode, ErrorInfo, ProtocolError};
use parley_scheduler::SchedulerError;
use parley_transport::TransportError;

use crate::Feature;

/// Errors that can occur during room operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// A room with this name already exists with different options.
    #[error("room {0} already exists with different options")]
    OptionsMismatch(String),

    /// The requested options are not usable.
    #[error("invalid room options: {0}")]
    InvalidOptions(String),

    /// The feature was not enabled in the room's options.
    #[error("{0} is not enabled for this room")]
    FeatureNotEnabled(Feature),

    /// A lifecycle operation failed. Carries the coded error, e.g. the
    /// attachment code of the feature whose channel would not attach.
    #[error("room lifecycle error: {0}")]
    Lifecycle(ErrorInfo),

    /// The message subscription was already unsubscribed.
    #[error("subscription has already been unsubscribed")]
    AlreadyUnsubscribed,

    /// The operation never ran to completion inside the scheduler.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A channel operation failed outside of the lifecycle.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The chat REST API returned an error.
    #[error("chat api error: {0}")]
    Api(ErrorInfo),
}

impl RoomError {
    /// The coded error behind this failure, if it carries one.
    pub fn info(&self) -> Option<&ErrorInfo> {
        match self {
            Self::Lifecycle(info) | Self::Api(info) => Some(info),
            Self::Transport(e) => e.reason(),
            _ => None,
        }
    }

    /// Returns `true` if this failure carries `code`.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.info().is_some_and(|info| code.matches(info))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_error_exposes_code() {
        let err = RoomError::Lifecycle(ErrorCode::PresenceAttachmentFailed.info("nope"));
        assert!(err.has_code(ErrorCode::PresenceAttachmentFailed));
        assert!(!err.has_code(ErrorCode::MessagesAttachmentFailed));
    }

    #[test]
    fn test_usage_errors_carry_no_code() {
        assert!(RoomError::AlreadyUnsubscribed.info().is_none());
        assert!(RoomError::FeatureNotEnabled(Feature::Typing).info().is_none());
    }

    #[test]
    fn test_feature_not_enabled_names_feature() {
        let err = RoomError::FeatureNotEnabled(Feature::Reactions);
        assert_eq!(err.to_string(), "reactions is not enabled for this room");
    }
}
