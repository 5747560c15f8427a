//! The contract between a room feature and the lifecycle manager.
//!
//! Each feature (messages, presence, typing, reactions, occupancy) is a
//! [`Contributor`]: it owns a reference to a transport channel and can be
//! attached, detached, released, and told that continuity was lost. The
//! lifecycle manager drives contributors without knowing which feature is
//! which.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parley_protocol::{ErrorCode, ErrorInfo};
use parley_transport::{Channel, ChannelManager, ChannelState, TransportError};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const DISCONTINUITY_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Feature
// ---------------------------------------------------------------------------

/// A room feature.
///
/// The ordering of the variants is the attach precedence: rooms attach
/// features in ascending order and detach or release them in descending
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Messages,
    Presence,
    Typing,
    Reactions,
    Occupancy,
}

impl Feature {
    /// The code reported when this feature's channel fails to attach.
    pub fn attachment_error_code(self) -> ErrorCode {
        match self {
            Self::Messages => ErrorCode::MessagesAttachmentFailed,
            Self::Presence => ErrorCode::PresenceAttachmentFailed,
            Self::Typing => ErrorCode::TypingAttachmentFailed,
            Self::Reactions => ErrorCode::ReactionsAttachmentFailed,
            Self::Occupancy => ErrorCode::OccupancyAttachmentFailed,
        }
    }

    /// The code reported when this feature's channel fails to detach.
    pub fn detachment_error_code(self) -> ErrorCode {
        match self {
            Self::Messages => ErrorCode::MessagesDetachmentFailed,
            Self::Presence => ErrorCode::PresenceDetachmentFailed,
            Self::Typing => ErrorCode::TypingDetachmentFailed,
            Self::Reactions => ErrorCode::ReactionsDetachmentFailed,
            Self::Occupancy => ErrorCode::OccupancyDetachmentFailed,
        }
    }

    /// The name of the transport channel this feature uses in `room`.
    ///
    /// Messages, presence, and occupancy share one channel; typing and
    /// reactions each have their own.
    pub fn channel_name(self, room: &str) -> String {
        match self {
            Self::Messages | Self::Presence | Self::Occupancy => {
                format!("{room}::$chat::$chatMessages")
            }
            Self::Typing => format!("{room}::$chat::$typingIndicators"),
            Self::Reactions => format!("{room}::$chat::$reactions"),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Messages => "messages",
            Self::Presence => "presence",
            Self::Typing => "typing",
            Self::Reactions => "reactions",
            Self::Occupancy => "occupancy",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Contributor
// ---------------------------------------------------------------------------

/// A feature taking part in a room's lifecycle.
///
/// `attach` and `detach` default to attaching and detaching the feature's
/// channel. The lifecycle manager maps their failures to the feature's
/// error codes.
#[async_trait]
pub trait Contributor: Send + Sync + 'static {
    /// Which feature this is.
    fn feature(&self) -> Feature;

    /// The transport channel the feature runs on.
    fn channel(&self) -> &Arc<dyn Channel>;

    /// The code reported when attaching fails.
    fn attachment_error_code(&self) -> ErrorCode {
        self.feature().attachment_error_code()
    }

    /// The code reported when detaching fails.
    fn detachment_error_code(&self) -> ErrorCode {
        self.feature().detachment_error_code()
    }

    /// Attaches the feature's channel.
    async fn attach(&self) -> Result<(), TransportError> {
        self.channel().attach().await
    }

    /// Detaches the feature's channel.
    async fn detach(&self) -> Result<(), TransportError> {
        self.channel().detach().await
    }

    /// Lets go of the feature's channel and any background work. Never
    /// fails; problems are logged.
    async fn release(&self);

    /// Reports that the feature's channel lost continuity.
    fn discontinuity_detected(&self, reason: ErrorInfo);
}

// ---------------------------------------------------------------------------
// FeatureChannel
// ---------------------------------------------------------------------------

/// A feature's reference to its (possibly shared) channel, plus its
/// discontinuity stream.
pub(crate) struct FeatureChannel {
    feature: Feature,
    name: String,
    channel: Arc<dyn Channel>,
    channels: Arc<ChannelManager>,
    discontinuities: broadcast::Sender<ErrorInfo>,
    released: AtomicBool,
}

impl FeatureChannel {
    /// Takes a reference to `feature`'s channel in `room`.
    pub(crate) fn acquire(feature: Feature, room: &str, channels: Arc<ChannelManager>) -> Self {
        let name = feature.channel_name(room);
        let channel = channels.acquire(&name);
        Self {
            feature,
            name,
            channel,
            channels,
            discontinuities: broadcast::channel(DISCONTINUITY_CAPACITY).0,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub(crate) fn client_id(&self) -> String {
        self.channels.client_id()
    }

    pub(crate) fn on_discontinuity(&self) -> broadcast::Receiver<ErrorInfo> {
        self.discontinuities.subscribe()
    }

    pub(crate) fn discontinuity_detected(&self, reason: ErrorInfo) {
        tracing::warn!(feature = %self.feature, channel = %self.name, error = %reason, "discontinuity detected");
        let _ = self.discontinuities.send(reason);
    }

    /// Drops this feature's channel reference. The last user of a shared
    /// channel detaches it first. Releasing twice is a no-op.
    pub(crate) async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let last_user = self.channels.ref_count(&self.name) <= 1;
        let state = self.channel.state();
        let needs_detach = !matches!(
            state,
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Failed
        );
        if last_user && needs_detach {
            if let Err(e) = self.channel.detach().await {
                tracing::warn!(
                    feature = %self.feature,
                    channel = %self.name,
                    error = %e,
                    "failed to detach channel during release"
                );
            }
        }

        self.channels.release(&self.name);
        tracing::debug!(feature = %self.feature, channel = %self.name, "feature released");
    }
}
