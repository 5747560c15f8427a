//! Realtime channel abstraction for Parley.
//!
//! Parley does not speak to the realtime service directly. Everything it
//! needs from the pub/sub transport is expressed by the [`Channel`] and
//! [`ChannelProvider`] traits in this crate:
//!
//! - attach / detach of a named channel
//! - a stream of [`ChannelStateChange`]s, including the `resumed` flag
//! - the serial the channel was attached at
//! - publish / subscribe of [`ChannelEvent`]s and presence
//!
//! [`ChannelManager`] layers reference counting on top of a provider so
//! several room features can share one channel.
//!
//! # Feature Flags
//!
//! - `local` (default): in-memory transport ([`LocalTransport`]) used by
//!   tests and demos, with fault injection hooks.

mod error;
#[cfg(feature = "local")]
mod local;
mod manager;

pub use error::{ErrorInfo, TransportError};
#[cfg(feature = "local")]
pub use local::{LocalChannel, LocalTransport, OperationGate};
pub use manager::ChannelManager;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// A position in a channel's message sequence.
///
/// Serials are opaque strings that compare lexicographically in delivery
/// order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Serial(pub String);

impl Serial {
    /// Creates a serial from any string-like value.
    pub fn new(serial: impl Into<String>) -> Self {
        Self(serial.into())
    }

    /// Returns the serial as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The lifecycle state of a single transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "initialized",
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Detached => "detached",
            Self::Suspended => "suspended",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A change in a channel's state, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStateChange {
    /// State before the change.
    pub previous: ChannelState,
    /// State after the change.
    pub current: ChannelState,
    /// For `Attached`: whether message continuity was preserved across
    /// the (re)attachment. `false` means a discontinuity.
    pub resumed: bool,
    /// Why the change happened, if the transport reported a reason.
    pub reason: Option<ErrorInfo>,
    /// For `Attached`: the serial the channel attached at.
    pub attach_serial: Option<Serial>,
}

/// An event published on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Event name (e.g. `chat.message`).
    pub name: String,
    /// Event payload.
    pub data: serde_json::Value,
    /// Publishing client, stamped by the transport.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Position in the channel, stamped by the transport.
    #[serde(default)]
    pub serial: Option<Serial>,
    /// Milliseconds since the Unix epoch, stamped by the transport.
    #[serde(default)]
    pub timestamp: u64,
    /// Out-of-band data such as headers.
    #[serde(default)]
    pub extras: serde_json::Value,
}

impl ChannelEvent {
    /// Creates an unstamped event ready to publish.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            client_id: None,
            serial: None,
            timestamp: 0,
            extras: serde_json::Value::Null,
        }
    }
}

/// What a presence message reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Enter,
    Present,
    Update,
    Leave,
}

/// A presence message: one client's presence on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMessage {
    /// What happened.
    pub action: PresenceAction,
    /// Whose presence this is.
    pub client_id: String,
    /// Optional member data.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// One realtime channel.
///
/// Implementations are owned by the transport and shared between every
/// user of the same channel name; all methods take `&self`.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// The channel name.
    fn name(&self) -> &str;

    /// Current channel state.
    fn state(&self) -> ChannelState;

    /// The reason for the last transition into `Suspended` or `Failed`.
    fn error_reason(&self) -> Option<ErrorInfo>;

    /// The serial of the most recent attachment, if attached.
    fn attach_serial(&self) -> Option<Serial>;

    /// Subscribes to state changes. Only changes issued after this call
    /// are delivered.
    fn on_state_change(&self) -> broadcast::Receiver<ChannelStateChange>;

    /// Attaches the channel. Attaching an attached channel is a no-op.
    async fn attach(&self) -> Result<(), TransportError>;

    /// Detaches the channel. Detaching a detached channel is a no-op.
    async fn detach(&self) -> Result<(), TransportError>;

    /// Publishes an event.
    async fn publish(&self, event: ChannelEvent) -> Result<(), TransportError>;

    /// Subscribes to published events.
    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Enters this client into the channel's presence set.
    async fn enter_presence(&self, data: Option<serde_json::Value>) -> Result<(), TransportError>;

    /// Updates this client's presence data.
    async fn update_presence(&self, data: Option<serde_json::Value>) -> Result<(), TransportError>;

    /// Removes this client from the presence set.
    async fn leave_presence(&self, data: Option<serde_json::Value>) -> Result<(), TransportError>;

    /// Returns the current presence set.
    async fn presence_members(&self) -> Result<Vec<PresenceMessage>, TransportError>;

    /// Subscribes to presence messages.
    fn on_presence(&self) -> broadcast::Receiver<PresenceMessage>;
}

/// Hands out channels by name and takes them back when no longer needed.
pub trait ChannelProvider: Send + Sync + 'static {
    /// Returns the channel for `name`, creating it if needed.
    fn channel(&self, name: &str) -> Arc<dyn Channel>;

    /// Tells the transport nothing uses `name` any more.
    fn release(&self, name: &str);

    /// The client id of the underlying connection.
    fn client_id(&self) -> String;
}
