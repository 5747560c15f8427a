//! Chat rooms for Parley.
//!
//! A room bundles up to five features that share realtime channels:
//! messages, presence, typing, reactions, and occupancy. This crate
//! coordinates their attach, detach, and release so that the room as a
//! whole moves through one well-defined status.
//!
//! # Key types
//!
//! - [`Rooms`]: hands out one room per name, arbitrating `get` against
//!   `release`
//! - [`Room`]: the features plus their lifecycle
//! - [`LifecycleManager`]: drives [`Contributor`]s through
//!   [`RoomStatus`], one operation at a time
//! - [`Messages`], [`Presence`], [`Typing`], [`Reactions`], [`Occupancy`]:
//!   the features
//! - [`RoomOptions`] / [`ClientOptions`]: configuration
//!
//! # Architecture
//!
//! ```text
//! Rooms ─get/release─▶ Room ─▶ LifecycleManager ─▶ AtomicScheduler
//!                                    │
//!                                    ▼
//!                    Contributor × 5 ─▶ ChannelManager ─▶ Channel
//! ```

mod api;
mod contributor;
mod error;
mod features;
mod lifecycle;
#[cfg(feature = "local")]
mod local;
mod options;
mod registry;
mod room;
mod status;

pub use api::ChatApi;
pub use contributor::{Contributor, Feature};
pub use error::RoomError;
pub use features::{
    EventSubscription, MessageSubscription, Messages, Occupancy, Presence, PresenceSubscription,
    Reactions, Typing, TypingSubscription,
};
pub use lifecycle::LifecycleManager;
#[cfg(feature = "local")]
pub use local::LocalChatApi;
pub use options::{
    ClientOptions, OccupancyOptions, PresenceOptions, ReactionsOptions, RoomOptions,
    TypingOptions,
};
pub use registry::Rooms;
pub use room::Room;
pub use status::{RoomStatus, RoomStatusChange, StatusSubscription};
