//! Room and client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RoomError;

// ---------------------------------------------------------------------------
// Feature options
// ---------------------------------------------------------------------------

/// Presence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceOptions {
    /// Whether this client may enter presence.
    pub enter: bool,
    /// Whether this client receives presence events.
    pub subscribe: bool,
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            enter: true,
            subscribe: true,
        }
    }
}

/// Typing indicator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingOptions {
    /// How long after the last `start()` the client is considered to have
    /// stopped typing.
    pub timeout: Duration,
}

impl Default for TypingOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Room reaction settings. Reserved for future use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionsOptions {}

/// Occupancy settings. Reserved for future use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyOptions {}

// ---------------------------------------------------------------------------
// RoomOptions
// ---------------------------------------------------------------------------

/// Which features a room has, and how each is configured.
///
/// Messaging is always enabled. Every other feature is enabled by setting
/// its options. Two requests for the same room name must use equal
/// options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomOptions {
    /// Presence, if enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceOptions>,
    /// Typing indicators, if enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typing: Option<TypingOptions>,
    /// Room reactions, if enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<ReactionsOptions>,
    /// Occupancy, if enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occupancy: Option<OccupancyOptions>,
}

impl RoomOptions {
    /// Every feature enabled with default settings.
    pub fn all_features() -> Self {
        Self {
            presence: Some(PresenceOptions::default()),
            typing: Some(TypingOptions::default()),
            reactions: Some(ReactionsOptions::default()),
            occupancy: Some(OccupancyOptions::default()),
        }
    }

    /// Checks the options are usable.
    pub fn validate(&self) -> Result<(), RoomError> {
        if let Some(typing) = &self.typing {
            if typing.timeout.is_zero() {
                return Err(RoomError::InvalidOptions(
                    "typing timeout must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ClientOptions
// ---------------------------------------------------------------------------

/// Client-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Client id for transports the client creates itself.
    pub client_id: Option<String>,
    /// Default log filter directive, e.g. `"info"` or `"parley_room=debug"`.
    pub log_level: String,
    /// Delay before a retry that itself ended `Suspended` is tried again.
    pub retry_timeout: Duration,
    /// Upper bound of the random delay added to `retry_timeout`.
    pub retry_jitter: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            log_level: "info".into(),
            retry_timeout: Duration::from_millis(250),
            retry_jitter: Duration::from_millis(50),
        }
    }
}
