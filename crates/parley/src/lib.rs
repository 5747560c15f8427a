//! # Parley
//!
//! Chat rooms over realtime publish/subscribe channels.
//!
//! A room bundles messages, presence, typing indicators, reactions, and
//! occupancy. Parley attaches, detaches, and releases those features
//! together, recovers rooms when channels are suspended, and makes sure
//! that getting and releasing a room by name never race.
//!
//! The realtime transport and the chat REST API are supplied by the
//! application through [`ChannelProvider`](transport::ChannelProvider) and
//! [`ChatApi`](room::ChatApi). With the `local` feature (on by default),
//! in-memory versions of both are available for tests and demos.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parley::prelude::*;
//!
//! # async fn run() -> Result<(), ChatError> {
//! let options = ClientOptions::default();
//! parley::logging::init(&options);
//!
//! let client = ChatClient::builder().options(options).build_local();
//! let room = client.rooms().get("lobby", RoomOptions::all_features()).await?;
//! room.attach().await?;
//! room.messages()
//!     .send(SendMessageParams {
//!         text: "hello".into(),
//!         ..SendMessageParams::default()
//!     })
//!     .await?;
//! client.rooms().release("lobby").await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod logging;

pub use client::{ChatClient, ChatClientBuilder};
pub use error::ChatError;

pub use parley_protocol as protocol;
pub use parley_room as room;
pub use parley_scheduler as scheduler;
pub use parley_transport as transport;

/// The types most applications need.
pub mod prelude {
    pub use crate::{ChatClient, ChatClientBuilder, ChatError};
    pub use parley_protocol::{
        ErrorCode, ErrorInfo, Message, MessageEvent, OrderBy, QueryOptions, Reaction,
        SendMessageParams, SendReactionParams,
    };
    pub use parley_room::{
        ClientOptions, Feature, PresenceOptions, Room, RoomError, RoomOptions, RoomStatus,
        RoomStatusChange, Rooms, StatusSubscription, TypingOptions,
    };
}
