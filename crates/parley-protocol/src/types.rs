//! Chat payload types.
//!
//! These are the structures the chat features hand to callers and the
//! shapes their payloads take inside [`ChannelEvent::data`]. The transport
//! only sees JSON values; this module is where those values get names.
//!
//! [`ChannelEvent::data`]: parley_transport::ChannelEvent

use std::collections::BTreeSet;

use parley_transport::{PresenceAction, Serial};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Channel event names used by the chat features.
///
/// The realtime channel carries several kinds of traffic. The event name
/// is how a feature picks out the events that belong to it.
pub mod events {
    /// A chat message was created.
    pub const MESSAGE_CREATED: &str = "chat.message";
    /// A room reaction was sent.
    pub const ROOM_REACTION: &str = "roomReaction";
    /// Occupancy metrics published by the service.
    pub const OCCUPANCY: &str = "[meta]occupancy";
}

/// Free-form key/value data attached by the sender.
///
/// `serde_json::Map` keeps arbitrary JSON values, so metadata can hold
/// nested objects the chat layer never looks inside.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Flat key/value headers attached by the sender.
pub type Headers = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// The message's position in the room's message channel.
    pub serial: Serial,
    /// Who sent it.
    pub client_id: String,
    /// The room it was sent to.
    pub room_id: String,
    /// Message body.
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Sender-supplied metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Sender-supplied headers.
    #[serde(default)]
    pub headers: Headers,
}

impl Message {
    /// Returns `true` if this message was sent before `other`.
    ///
    /// Serials compare in delivery order, so this is a plain serial
    /// comparison.
    pub fn before(&self, other: &Message) -> bool {
        self.serial < other.serial
    }
}

/// The body of a `chat.message` event as it travels on the channel.
///
/// Serial, sender, and timestamp are stamped by the transport and are not
/// part of the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Message body.
    pub text: String,
    /// Sender-supplied metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// What happened to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageEventType {
    /// A new message was sent.
    Created,
}

/// A message event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    /// What happened.
    #[serde(rename = "type")]
    pub kind: MessageEventType,
    /// The message it happened to.
    pub message: Message,
}

/// Parameters for sending a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendMessageParams {
    /// Message body.
    pub text: String,
    /// Optional metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Optional headers.
    #[serde(default)]
    pub headers: Headers,
}

impl SendMessageParams {
    /// A plain text message with no metadata or headers.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// History queries
// ---------------------------------------------------------------------------

/// The order in which a history query returns items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OrderBy {
    /// Oldest items first.
    #[default]
    OldestFirst,
    /// Newest items first.
    NewestFirst,
}

/// A paginated history query.
///
/// `start` and `end` are millisecond timestamps (inclusive). `from_serial`
/// bounds the query to items delivered before that serial; it is set by
/// a subscription's "messages before I subscribed" query, not by callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Earliest timestamp to include.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    /// Latest timestamp to include.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
    /// Maximum number of items per page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Result ordering.
    #[serde(default)]
    pub order_by: OrderBy,
    /// Only items strictly before this serial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_serial: Option<Serial>,
}

impl QueryOptions {
    /// A query for at most `limit` items.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

/// One page of a history query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedResult<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Whether more items exist beyond this page.
    pub has_next: bool,
}

impl<T> PaginatedResult<T> {
    /// A single, final page.
    pub fn last_page(items: Vec<T>) -> Self {
        Self { items, has_next: false }
    }
}

// ---------------------------------------------------------------------------
// Presence and typing
// ---------------------------------------------------------------------------

/// A member of a room's presence set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMember {
    /// The member's client id.
    pub client_id: String,
    /// Member data, if any.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// When the member last changed, in milliseconds since the Unix epoch.
    pub updated_at: u64,
}

/// A change in a room's presence set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    /// What happened.
    pub action: PresenceAction,
    /// Whose presence changed.
    pub client_id: String,
    /// Member data, if any.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// The set of clients currently typing in a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    /// Client ids of everyone typing right now.
    pub currently_typing: BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Reactions and occupancy
// ---------------------------------------------------------------------------

/// The body of a `roomReaction` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionPayload {
    /// Reaction type, e.g. `"like"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Sender-supplied metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

/// A room reaction delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    /// Reaction type, e.g. `"like"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Sender-supplied metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Sender-supplied headers.
    #[serde(default)]
    pub headers: Headers,
    /// Who sent it.
    pub client_id: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Whether this client sent it.
    pub is_self: bool,
}

/// Parameters for sending a room reaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReactionParams {
    /// Reaction type, e.g. `"like"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Optional headers.
    #[serde(default)]
    pub headers: Headers,
}

/// Room occupancy metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyEvent {
    /// Connections attached to the room.
    pub connections: u32,
    /// Members of the room's presence set.
    pub presence_members: u32,
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! The JSON shapes here are what other clients of the same service
    //! put on the channel, so the serde attributes matter.

    use super::*;

    #[test]
    fn test_reaction_payload_uses_type_key() {
        let payload = ReactionPayload {
            kind: "like".into(),
            metadata: Metadata::new(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "like");
    }

    #[test]
    fn test_message_payload_metadata_defaults_to_empty() {
        let payload: MessagePayload =
            serde_json::from_value(serde_json::json!({"text": "hello"})).unwrap();
        assert_eq!(payload.text, "hello");
        assert!(payload.metadata.is_empty());
    }

    #[test]
    fn test_occupancy_event_is_camel_case() {
        let event: OccupancyEvent = serde_json::from_value(serde_json::json!({
            "connections": 3,
            "presenceMembers": 2,
        }))
        .unwrap();
        assert_eq!(event.connections, 3);
        assert_eq!(event.presence_members, 2);
    }

    #[test]
    fn test_query_options_skip_unset_fields() {
        let json = serde_json::to_value(QueryOptions::with_limit(10)).unwrap();
        assert_eq!(json["limit"], 10);
        assert!(json.get("fromSerial").is_none());
        assert_eq!(json["orderBy"], "oldestFirst");
    }

    #[test]
    fn test_message_before_compares_serials() {
        let message = |serial: &str| Message {
            serial: Serial::new(serial),
            client_id: "a".into(),
            room_id: "r".into(),
            text: String::new(),
            created_at: 0,
            metadata: Metadata::new(),
            headers: Headers::new(),
        };
        assert!(message("001").before(&message("002")));
        assert!(!message("002").before(&message("001")));
    }
}
