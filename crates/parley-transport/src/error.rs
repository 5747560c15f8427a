//! Error types for the transport layer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A coded error as reported by the realtime service.
///
/// `code` is the service-level error code (e.g. `102001`), `status_code`
/// mirrors the HTTP status the service would attach to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Service-level error code.
    pub code: u32,
    /// HTTP-like status code.
    pub status_code: u16,
    /// Human-readable description.
    pub message: String,
    /// The error this one was raised in response to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorInfo>>,
}

impl ErrorInfo {
    /// Creates an error with no cause.
    pub fn new(code: u32, status_code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            status_code,
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches `cause` to this error.
    pub fn with_cause(mut self, cause: ErrorInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {}, status {})", self.message, self.code, self.status_code)?;
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorInfo {}

/// Errors that can occur in the transport layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The channel could not be attached.
    #[error("attach failed on {channel}: {reason}")]
    AttachFailed {
        /// Channel name.
        channel: String,
        /// Reason reported by the service.
        reason: ErrorInfo,
    },

    /// The channel could not be detached.
    #[error("detach failed on {channel}: {reason}")]
    DetachFailed {
        /// Channel name.
        channel: String,
        /// Reason reported by the service.
        reason: ErrorInfo,
    },

    /// Publishing an event or presence update failed.
    #[error("publish failed on {channel}: {reason}")]
    PublishFailed {
        /// Channel name.
        channel: String,
        /// Reason reported by the service.
        reason: ErrorInfo,
    },

    /// The channel has been released and can no longer be used.
    #[error("channel {0} has been released")]
    Released(String),
}

impl TransportError {
    /// The service error carried by this failure, if any.
    pub fn reason(&self) -> Option<&ErrorInfo> {
        match self {
            Self::AttachFailed { reason, .. }
            | Self::DetachFailed { reason, .. }
            | Self::PublishFailed { reason, .. } => Some(reason),
            Self::Released(_) => None,
        }
    }
}
