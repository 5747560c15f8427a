//! `ChatClient` builder and client.
//!
//! This is the entry point for applications. It ties the layers together:
//! channel provider → channel manager → room registry.

use std::sync::Arc;

use parley_room::{ChatApi, ClientOptions, Rooms};
use parley_transport::{ChannelManager, ChannelProvider};

use crate::ChatError;

/// Builder for configuring a [`ChatClient`].
///
/// # Example
///
/// ```rust,ignore
/// use parley::prelude::*;
///
/// let client = ChatClient::builder()
///     .options(ClientOptions::default())
///     .build(provider, api);
/// let room = client.rooms().get("lobby", None).await?;
/// room.attach().await?;
/// ```
#[derive(Debug, Default)]
pub struct ChatClientBuilder {
    options: ClientOptions,
}

impl ChatClientBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the client options.
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the client options from JSON. Missing fields take their
    /// defaults.
    pub fn options_json(mut self, json: &str) -> Result<Self, ChatError> {
        self.options = serde_json::from_str(json)?;
        Ok(self)
    }

    /// Builds a client on top of `provider` and `api`.
    ///
    /// The client identifies as whatever `provider` says; a `client_id`
    /// in the options only applies to transports the client creates
    /// itself.
    pub fn build(self, provider: Arc<dyn ChannelProvider>, api: Arc<dyn ChatApi>) -> ChatClient {
        let client_id = provider.client_id();
        if let Some(requested) = &self.options.client_id {
            if *requested != client_id {
                tracing::warn!(
                    requested = %requested,
                    actual = %client_id,
                    "client_id option ignored, provider already has an identity"
                );
            }
        }

        let channels = Arc::new(ChannelManager::new(provider));
        tracing::info!(client_id = %client_id, "chat client ready");
        ChatClient {
            client_id,
            rooms: Rooms::new(channels, api, self.options),
        }
    }

    /// Builds a client on an in-memory transport and chat API.
    #[cfg(feature = "local")]
    pub fn build_local(self) -> ChatClient {
        use parley_room::LocalChatApi;
        use parley_transport::LocalTransport;

        let transport = Arc::new(match &self.options.client_id {
            Some(id) => LocalTransport::new(id.clone()),
            None => LocalTransport::with_random_client_id(),
        });
        let api = Arc::new(LocalChatApi::new(Arc::clone(&transport)));
        self.build(transport, api)
    }
}

/// A chat client: one identity and the rooms it has open.
pub struct ChatClient {
    client_id: String,
    rooms: Rooms,
}

impl ChatClient {
    /// Returns a builder with default settings.
    pub fn builder() -> ChatClientBuilder {
        ChatClientBuilder::new()
    }

    /// The registry of rooms opened by this client.
    pub fn rooms(&self) -> &Rooms {
        &self.rooms
    }

    /// The id this client is known by to other clients.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The options the client was built with.
    pub fn options(&self) -> &ClientOptions {
        self.rooms.client_options()
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("client_id", &self.client_id)
            .field("rooms", &self.rooms)
            .finish()
    }
}
