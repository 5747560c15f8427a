//! Chat payloads for Parley.
//!
//! This crate defines what the chat features exchange over a realtime
//! channel:
//!
//! - **Types** ([`Message`], [`Reaction`], [`PresenceEvent`],
//!   [`TypingEvent`], [`OccupancyEvent`], [`QueryOptions`], ...): the
//!   values callers see.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those values become
//!   channel event data and back.
//! - **Codes** ([`ErrorCode`]): the coded errors the chat layer reports.
//! - **Errors** ([`ProtocolError`]): what can go wrong while decoding.
//!
//! # Architecture
//!
//! ```text
//! Transport (ChannelEvent) → Protocol (Message, Reaction, ...) → Room features
//! ```

mod codec;
mod codes;
mod error;
mod types;

pub use codec::{
    Codec, JsonCodec, decode_message, decode_reaction, encode_message, encode_reaction,
    presence_event,
};
pub use codes::ErrorCode;
pub use error::ProtocolError;
pub use parley_transport::{ErrorInfo, PresenceAction, Serial};
pub use types::{
    Headers, Message, MessageEvent, MessageEventType, MessagePayload, Metadata, OccupancyEvent,
    OrderBy, PaginatedResult, PresenceEvent, PresenceMember, QueryOptions, Reaction,
    ReactionPayload, SendMessageParams, SendReactionParams, TypingEvent, events,
};
