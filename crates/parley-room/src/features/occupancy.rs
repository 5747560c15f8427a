//! Room occupancy.

use std::sync::Arc;

use async_trait::async_trait;
use parley_protocol::{Codec, ErrorInfo, JsonCodec, OccupancyEvent, events};
use parley_transport::{Channel, ChannelManager};
use tokio::sync::broadcast;

use super::EventSubscription;
use crate::contributor::FeatureChannel;
use crate::{ChatApi, Contributor, Feature, RoomError};

/// How many clients are connected to, and present in, a room.
///
/// Live updates arrive as `[meta]occupancy` events on the messages
/// channel; [`Occupancy::get`] asks the REST API instead.
pub struct Occupancy {
    room: String,
    base: FeatureChannel,
    api: Arc<dyn ChatApi>,
}

impl Occupancy {
    pub(crate) fn new(room: &str, channels: Arc<ChannelManager>, api: Arc<dyn ChatApi>) -> Arc<Self> {
        Arc::new(Self {
            room: room.to_owned(),
            base: FeatureChannel::acquire(Feature::Occupancy, room, channels),
            api,
        })
    }

    /// Fetches the current occupancy.
    pub async fn get(&self) -> Result<OccupancyEvent, RoomError> {
        self.api
            .get_occupancy(&self.room)
            .await
            .map_err(RoomError::Api)
    }

    /// Subscribes to occupancy updates.
    pub fn subscribe(&self) -> EventSubscription<OccupancyEvent> {
        EventSubscription::new(self.base.channel().subscribe(), |event| {
            if event.name != events::OCCUPANCY {
                return None;
            }
            JsonCodec
                .decode(&event.data)
                .inspect_err(|e| tracing::warn!(error = %e, "dropping undecodable occupancy event"))
                .ok()
        })
    }

    /// Subscribes to discontinuities on the occupancy channel.
    pub fn on_discontinuity(&self) -> broadcast::Receiver<ErrorInfo> {
        self.base.on_discontinuity()
    }
}

#[async_trait]
impl Contributor for Occupancy {
    fn feature(&self) -> Feature {
        Feature::Occupancy
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
    use crate::LocalChatApi;

    #[tokio::test]
    async fn test_get_and_subscribe() {
        let transport = Arc::new(LocalTransport::new("alice"));
        let channels = Arc::new(ChannelManager::new(transport.clone()));
        let api = Arc::new(LocalChatApi::new(transport.clone()));
        api.set_occupancy(
            "lobby",
            OccupancyEvent {
                connections: 2,
                presence_members: 1,
            },
        );
        let occupancy = Occupancy::new("lobby", channels, api);
        assert_eq!(occupancy.get().await.unwrap().connections, 2);

        let mut sub = occupancy.subscribe();
        let channel = transport.local_channel("lobby::$chat::$chatMessages");
        channel.deliver(ChannelEvent::new(events::OCCUPANCY, serde_json::json!("garbage")));
        channel.deliver(ChannelEvent::new(
            events::OCCUPANCY,
            serde_json::json!({"connections": 5, "presenceMembers": 3}),
        ));

        let update = sub.recv().await.unwrap();
        assert_eq!(
            update,
            OccupancyEvent {
                connections: 5,
                presence_members: 3,
            }
        );
    }
}
