//! Chat error codes.
//!
//! Every coded failure the chat layer reports uses one of these codes.
//! Attachment and detachment codes are per feature so a caller can tell
//! which part of a room broke.

use std::fmt;

use parley_transport::ErrorInfo;

/// A chat error code.
///
/// The discriminant is the numeric code the service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// The request was malformed or used a disabled feature.
    BadRequest = 40000,

    MessagesAttachmentFailed = 102001,
    PresenceAttachmentFailed = 102002,
    ReactionsAttachmentFailed = 102003,
    OccupancyAttachmentFailed = 102004,
    TypingAttachmentFailed = 102005,

    MessagesDetachmentFailed = 102050,
    PresenceDetachmentFailed = 102051,
    ReactionsDetachmentFailed = 102052,
    OccupancyDetachmentFailed = 102053,
    TypingDetachmentFailed = 102054,

    /// The room is `Failed`; it must be released.
    RoomInFailedState = 102101,
    /// The room is being released.
    RoomIsReleasing = 102102,
    /// The room has been released.
    RoomIsReleased = 102103,
    /// An earlier lifecycle operation failed.
    PreviousOperationFailed = 102104,
    /// A lifecycle operation hit an unexpected condition.
    RoomLifecycleError = 102105,
    /// Continuity on a room channel was lost.
    RoomDiscontinuity = 102106,
}

impl ErrorCode {
    /// The numeric code.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// The status code the service pairs with this code.
    pub fn status_code(self) -> u16 {
        match self {
            Self::BadRequest
            | Self::RoomInFailedState
            | Self::RoomIsReleasing
            | Self::RoomIsReleased => 400,
            _ => 500,
        }
    }

    /// Builds an [`ErrorInfo`] with this code.
    pub fn info(self, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo::new(self.code(), self.status_code(), message)
    }

    /// Returns `true` if `info` carries this code.
    pub fn matches(self, info: &ErrorInfo) -> bool {
        info.code == self.code()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_service_values() {
        assert_eq!(ErrorCode::MessagesAttachmentFailed.code(), 102001);
        assert_eq!(ErrorCode::TypingDetachmentFailed.code(), 102054);
        assert_eq!(ErrorCode::RoomIsReleased.code(), 102103);
    }

    #[test]
    fn test_info_carries_code_and_status() {
        let info = ErrorCode::RoomInFailedState.info("room failed");
        assert_eq!(info.code, 102101);
        assert_eq!(info.status_code, 400);
        assert!(ErrorCode::RoomInFailedState.matches(&info));
        assert!(!ErrorCode::RoomIsReleased.matches(&info));
    }

    #[test]
    fn test_attachment_failures_are_server_errors() {
        assert_eq!(ErrorCode::PresenceAttachmentFailed.status_code(), 500);
    }
}
