//! A chat room: its features and the lifecycle that drives them.

use std::sync::Arc;

use parley_protocol::ErrorInfo;
use parley_transport::ChannelManager;

use crate::features::{Messages, Occupancy, Presence, Reactions, Typing};
use crate::{
    ChatApi, ClientOptions, Contributor, Feature, LifecycleManager, RoomError, RoomOptions,
    RoomStatus, StatusSubscription,
};

/// A chat room.
///
/// Messages are always available; the other features exist only if the
/// room's options enable them. Obtain rooms from
/// [`Rooms::get`](crate::Rooms::get).
pub struct Room {
    name: String,
    options: RoomOptions,
    lifecycle: Arc<LifecycleManager>,
    messages: Arc<Messages>,
    presence: Option<Arc<Presence>>,
    typing: Option<Arc<Typing>>,
    reactions: Option<Arc<Reactions>>,
    occupancy: Option<Arc<Occupancy>>,
}

impl Room {
    pub(crate) fn new(
        name: &str,
        options: RoomOptions,
        channels: &Arc<ChannelManager>,
        api: &Arc<dyn ChatApi>,
        client: &ClientOptions,
    ) -> Result<Self, RoomError> {
        options.validate()?;

        let messages = Messages::new(name, Arc::clone(channels), Arc::clone(api));
        let presence = options
            .presence
            .clone()
            .map(|o| Presence::new(name, Arc::clone(channels), o));
        let typing = options
            .typing
            .clone()
            .map(|o| Typing::new(name, Arc::clone(channels), o));
        let reactions = options
            .reactions
            .as_ref()
            .map(|_| Reactions::new(name, Arc::clone(channels)));
        let occupancy = options
            .occupancy
            .as_ref()
            .map(|_| Occupancy::new(name, Arc::clone(channels), Arc::clone(api)));

        let mut contributors: Vec<Arc<dyn Contributor>> = vec![messages.clone() as Arc<dyn Contributor>];
        if let Some(presence) = &presence {
            contributors.push(presence.clone());
        }
        if let Some(typing) = &typing {
            contributors.push(typing.clone());
        }
        if let Some(reactions) = &reactions {
            contributors.push(reactions.clone());
        }
        if let Some(occupancy) = &occupancy {
            contributors.push(occupancy.clone());
        }
        let lifecycle = LifecycleManager::new(name, contributors, client);

        tracing::debug!(room = %name, ?options, "room created");
        Ok(Self {
            name: name.to_owned(),
            options,
            lifecycle,
            messages,
            presence,
            typing,
            reactions,
            occupancy,
        })
    }

    /// The room's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The options the room was created with.
    pub fn options(&self) -> &RoomOptions {
        &self.options
    }

    pub fn status(&self) -> RoomStatus {
        self.lifecycle.status()
    }

    /// The error behind the current status, e.g. why the room failed.
    pub fn error(&self) -> Option<ErrorInfo> {
        self.lifecycle.error()
    }

    pub fn on_status_change(&self) -> StatusSubscription {
        self.lifecycle.on_status_change()
    }

    /// Attaches every enabled feature.
    pub async fn attach(&self) -> Result<(), RoomError> {
        self.lifecycle.attach().await
    }

    /// Detaches every enabled feature.
    pub async fn detach(&self) -> Result<(), RoomError> {
        self.lifecycle.detach().await
    }

    /// Releases the room's channels.
    ///
    /// Prefer [`Rooms::release`](crate::Rooms::release), which also removes
    /// the room from the registry.
    pub async fn release(&self) -> Result<(), RoomError> {
        self.lifecycle.release().await
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    pub fn presence(&self) -> Result<&Presence, RoomError> {
        self.presence
            .as_deref()
            .ok_or(RoomError::FeatureNotEnabled(Feature::Presence))
    }

    pub fn typing(&self) -> Result<&Typing, RoomError> {
        self.typing
            .as_deref()
            .ok_or(RoomError::FeatureNotEnabled(Feature::Typing))
    }

    pub fn reactions(&self) -> Result<&Reactions, RoomError> {
        self.reactions
            .as_deref()
            .ok_or(RoomError::FeatureNotEnabled(Feature::Reactions))
    }

    pub fn occupancy(&self) -> Result<&Occupancy, RoomError> {
        self.occupancy
            .as_deref()
            .ok_or(RoomError::FeatureNotEnabled(Feature::Occupancy))
    }

    /// The room's lifecycle manager.
    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("options", &self.options)
            .finish()
    }
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use parley_transport::{Channel, ChannelState, LocalTransport};

    use super::*;
    use crate::LocalChatApi;

    fn room(options: RoomOptions) -> (Arc<LocalTransport>, Room) {
        let transport = Arc::new(LocalTransport::new("alice"));
        let channels = Arc::new(ChannelManager::new(transport.clone()));
        let api: Arc<dyn ChatApi> = Arc::new(LocalChatApi::new(transport.clone()));
        let room = Room::new("lobby", options, &channels, &api, &ClientOptions::default()).unwrap();
        (transport, room)
    }

    #[tokio::test]
    async fn test_default_room_has_messages_only() {
        let (_transport, room) = room(RoomOptions::default());
        assert_eq!(room.name(), "lobby");
        assert_eq!(room.status(), RoomStatus::Initialized);
        assert!(matches!(
            room.presence(),
            Err(RoomError::FeatureNotEnabled(Feature::Presence))
        ));
        assert!(room.typing().is_err());
        assert!(room.reactions().is_err());
        assert!(room.occupancy().is_err());
    }

    #[tokio::test]
    async fn test_attach_attaches_enabled_channels() {
        let (transport, room) = room(RoomOptions::all_features());
        room.attach().await.unwrap();

        assert_eq!(room.status(), RoomStatus::Attached);
        for name in [
            "lobby::$chat::$chatMessages",
            "lobby::$chat::$typingIndicators",
            "lobby::$chat::$reactions",
        ] {
            assert_eq!(transport.local_channel(name).state(), ChannelState::Attached, "{name}");
        }
        assert!(room.presence().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_options_are_rejected() {
        let transport = Arc::new(LocalTransport::new("alice"));
        let channels = Arc::new(ChannelManager::new(transport.clone()));
        let api: Arc<dyn ChatApi> = Arc::new(LocalChatApi::new(transport));
        let options = RoomOptions {
            typing: Some(crate::TypingOptions {
                timeout: std::time::Duration::ZERO,
            }),
            ..RoomOptions::default()
        };
        let err = Room::new("lobby", options, &channels, &api, &ClientOptions::default()).unwrap_err();
        assert!(matches!(err, RoomError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_release_releases_shared_channel_once() {
        let (transport, room) = room(RoomOptions::all_features());
        let messages = transport.local_channel("lobby::$chat::$chatMessages");
        room.attach().await.unwrap();
        room.release().await.unwrap();

        assert_eq!(room.status(), RoomStatus::Released);
        let released = transport.released();
        assert_eq!(
            released
                .iter()
                .filter(|n| n.as_str() == "lobby::$chat::$chatMessages")
                .count(),
            1
        );
        assert_eq!(messages.state(), ChannelState::Detached);
        assert_eq!(messages.detach_calls(), 1);
    }
}
