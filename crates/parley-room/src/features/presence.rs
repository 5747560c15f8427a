//! Room presence.

use std::sync::Arc;

use async_trait::async_trait;
use parley_protocol::{ErrorInfo, PresenceEvent, PresenceMember, presence_event};
use parley_transport::{Channel, ChannelManager, PresenceMessage};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::contributor::FeatureChannel;
use crate::options::PresenceOptions;
use crate::{Contributor, Feature, RoomError};

/// Who is in a room.
///
/// Presence runs on the room's messages channel. Entering is explicit;
/// attaching the room does not enter this client.
pub struct Presence {
    room: String,
    base: FeatureChannel,
    options: PresenceOptions,
}

impl Presence {
    pub(crate) fn new(room: &str, channels: Arc<ChannelManager>, options: PresenceOptions) -> Arc<Self> {
        Arc::new(Self {
            room: room.to_owned(),
            base: FeatureChannel::acquire(Feature::Presence, room, channels),
            options,
        })
    }

    fn ensure_can_enter(&self) -> Result<(), RoomError> {
        if self.options.enter {
            Ok(())
        } else {
            Err(RoomError::InvalidOptions(
                "presence enter is disabled for this room".into(),
            ))
        }
    }

    /// Enters this client into the room's presence set.
    pub async fn enter(&self, data: Option<serde_json::Value>) -> Result<(), RoomError> {
        self.ensure_can_enter()?;
        self.base.channel().enter_presence(data).await?;
        tracing::debug!(room = %self.room, "entered presence");
        Ok(())
    }

    /// Updates this client's presence data.
    pub async fn update(&self, data: Option<serde_json::Value>) -> Result<(), RoomError> {
        self.ensure_can_enter()?;
        self.base.channel().update_presence(data).await?;
        Ok(())
    }

    /// Removes this client from the presence set.
    pub async fn leave(&self, data: Option<serde_json::Value>) -> Result<(), RoomError> {
        self.base.channel().leave_presence(data).await?;
        tracing::debug!(room = %self.room, "left presence");
        Ok(())
    }

    /// The current presence set.
    pub async fn get(&self) -> Result<Vec<PresenceMember>, RoomError> {
        let members = self.base.channel().presence_members().await?;
        Ok(members
            .into_iter()
            .map(|m| PresenceMember {
                client_id: m.client_id,
                data: m.data,
                updated_at: m.timestamp,
            })
            .collect())
    }

    /// Returns `true` if `client_id` is in the presence set.
    pub async fn is_present(&self, client_id: &str) -> Result<bool, RoomError> {
        let members = self.base.channel().presence_members().await?;
        Ok(members.iter().any(|m| m.client_id == client_id))
    }

    /// Subscribes to presence changes.
    pub fn subscribe(&self) -> Result<PresenceSubscription, RoomError> {
        if !self.options.subscribe {
            return Err(RoomError::InvalidOptions(
                "presence subscribe is disabled for this room".into(),
            ));
        }
        Ok(PresenceSubscription {
            messages: self.base.channel().on_presence(),
        })
    }

    /// Subscribes to discontinuities on the presence channel.
    pub fn on_discontinuity(&self) -> broadcast::Receiver<ErrorInfo> {
        self.base.on_discontinuity()
    }
}

#[async_trait]
impl Contributor for Presence {
    fn feature(&self) -> Feature {
        Feature::Presence
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        self.base.channel()
    }

    async fn release(&self) {
        self.base.release().await;
    }

    fn discontinuity_detected(&self, reason: ErrorInfo) {
        self.base.discontinuity_detected(reason);
    }
}

/// A live subscription to presence changes.
pub struct PresenceSubscription {
    messages: broadcast::Receiver<PresenceMessage>,
}

impl PresenceSubscription {
    /// Waits for the next presence event.
    pub async fn recv(&mut self) -> Option<PresenceEvent> {
        loop {
            match self.messages.recv().await {
                Ok(message) => return Some(presence_event(message)),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "presence subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
