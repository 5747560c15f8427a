//! Room reactions: short-lived, ephemeral "likes" sent to everyone in the
//! room.

use std::sync::Arc;

use async_trait::async_trait;
use parley_protocol::{
    ErrorInfo, JsonCodec, Reaction, SendReactionParams, decode_reaction, encode_reaction, events,
};
use parley_transport::{Channel, ChannelManager};
use tokio::sync::broadcast;

use super::EventSubscription;
use crate::contributor::FeatureChannel;
use crate::{Contributor, Feature, RoomError};

/// Sending and receiving room reactions.
pub struct Reactions {
    room: String,
    base: FeatureChannel,
    client_id: String,
}

impl Reactions {
    pub(crate) fn new(room: &str, channels: Arc<ChannelManager>) -> Arc<Self> {
        let base = FeatureChannel::acquire(Feature::Reactions, room, channels);
        let client_id = base.client_id();
        Arc::new(Self {
            room: room.to_owned(),
            base,
            client_id,
        })
    }

    /// Sends a reaction to everyone in the room.
    pub async fn send(&self, params: SendReactionParams) -> Result<(), RoomError> {
        if params.kind.is_empty() {
            return Err(RoomError::InvalidOptions("reaction type must not be empty".into()));
        }
        let event = encode_reaction(&JsonCodec, &params)?;
        self.base.channel().publish(event).await?;
        tracing::trace!(room = %self.room, kind = %params.kind, "reaction sent");
        Ok(())
    }

    /// Subscribes to reactions, including this client's own.
    pub fn subscribe(&self) -> EventSubscription<Reaction> {
        let client_id = self.client_id.clone();
        EventSubscription::new(self.base.channel().subscribe(), move |event| {
            if event.name != events::ROOM_REACTION {
                return None;
            }
            decode_reaction(&JsonCodec, &client_id, event)
                .inspect_err(|e| tracing::warn!(error = %e, "dropping undecodable reaction"))
                .ok()
        })
    }

    /// Subscribes to discontinuities on the reactions channel.
    pub fn on_discontinuity(&self) -> broadcast::Receiver<ErrorInfo> {
        self.base.on_discontinuity()
    }
}

#[async_trait]
impl Contributor for Reactions {
    fn feature(&self) -> Feature {
        Feature::Reactions
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

#[cfg(all(test, feature = "local"))]
mod tests {
    use parley_transport::{ChannelEvent, LocalTransport};

    use super::*;

    #[tokio::test]
    async fn test_own_and_foreign_reactions() {
        let transport = Arc::new(LocalTransport::new("alice"));
        let channels = Arc::new(ChannelManager::new(transport.clone()));
        let reactions = Reactions::new("lobby", channels);
        let mut sub = reactions.subscribe();

        reactions
            .send(SendReactionParams {
                kind: "like".into(),
                ..SendReactionParams::default()
            })
            .await
            .unwrap();

        let channel = transport.local_channel("lobby::$chat::$reactions");
        channel.deliver(ChannelEvent::new("unrelated", serde_json::json!({})));
        let mut foreign = ChannelEvent::new(events::ROOM_REACTION, serde_json::json!({"type": "heart"}));
        foreign.client_id = Some("bob".into());
        channel.deliver(foreign);

        let own = sub.recv().await.unwrap();
        assert_eq!(own.kind, "like");
        assert!(own.is_self);

        let other = sub.recv().await.unwrap();
        assert_eq!(other.kind, "heart");
        assert_eq!(other.client_id, "bob");
        assert!(!other.is_self);
    }

    #[tokio::test]
    async fn test_empty_reaction_type_is_rejected() {
        let transport = Arc::new(LocalTransport::new("alice"));
        let channels = Arc::new(ChannelManager::new(transport));
        let reactions = Reactions::new("lobby", channels);
        let err = reactions.send(SendReactionParams::default()).await.unwrap_err();
        assert!(matches!(err, RoomError::InvalidOptions(_)));
    }
}
