//! Codec trait and the mapping between chat payloads and channel events.
//!
//! The transport carries [`ChannelEvent`]s whose `data` is an arbitrary
//! JSON value. A codec decides how a typed payload becomes that value and
//! back. [`JsonCodec`] is a straight serde mapping; the helper functions
//! below use a codec to build and read the events each feature cares about.

use parley_transport::{ChannelEvent, PresenceMessage};
use serde::{Serialize, de::DeserializeOwned};

use crate::types::{
    Headers, Message, MessagePayload, PresenceEvent, Reaction, ReactionPayload,
    SendReactionParams, events,
};
use crate::ProtocolError;

/// Converts typed payloads to and from channel event data.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a payload into event data.
    fn encode<T: Serialize>(&self, value: &T) -> Result<serde_json::Value, ProtocolError>;

    /// Deserializes event data into a payload.
    fn decode<T: DeserializeOwned>(&self, data: &serde_json::Value) -> Result<T, ProtocolError>;
}

/// A [`Codec`] that maps payloads to JSON with serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<serde_json::Value, ProtocolError> {
        serde_json::to_value(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &serde_json::Value) -> Result<T, ProtocolError> {
        // `T::deserialize` borrows the value instead of consuming it, so
        // the event stays usable by other subscribers.
        T::deserialize(data).map_err(ProtocolError::Decode)
    }
}

fn headers_of(event: &ChannelEvent) -> Headers {
    event
        .extras
        .get("headers")
        .and_then(|h| h.as_object())
        .cloned()
        .unwrap_or_default()
}

fn extras_with_headers(headers: &Headers) -> serde_json::Value {
    if headers.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::json!({ "headers": headers })
    }
}

/// Reads a `chat.message` event published in `room_id`.
pub fn decode_message<C: Codec>(
    codec: &C,
    room_id: &str,
    event: &ChannelEvent,
) -> Result<Message, ProtocolError> {
    let payload: MessagePayload = codec.decode(&event.data)?;
    let serial = event
        .serial
        .clone()
        .ok_or_else(|| ProtocolError::InvalidEvent("message event without serial".into()))?;
    let client_id = event
        .client_id
        .clone()
        .ok_or_else(|| ProtocolError::InvalidEvent("message event without client id".into()))?;
    Ok(Message {
        serial,
        client_id,
        room_id: room_id.to_owned(),
        text: payload.text,
        created_at: event.timestamp,
        metadata: payload.metadata,
        headers: headers_of(event),
    })
}

/// Builds the `chat.message` event for a message body.
pub fn encode_message<C: Codec>(
    codec: &C,
    payload: &MessagePayload,
    headers: &Headers,
) -> Result<ChannelEvent, ProtocolError> {
    let mut event = ChannelEvent::new(events::MESSAGE_CREATED, codec.encode(payload)?);
    event.extras = extras_with_headers(headers);
    Ok(event)
}

/// Builds the `roomReaction` event for a reaction.
pub fn encode_reaction<C: Codec>(
    codec: &C,
    params: &SendReactionParams,
) -> Result<ChannelEvent, ProtocolError> {
    let payload = ReactionPayload {
        kind: params.kind.clone(),
        metadata: params.metadata.clone(),
    };
    let mut event = ChannelEvent::new(events::ROOM_REACTION, codec.encode(&payload)?);
    event.extras = extras_with_headers(&params.headers);
    Ok(event)
}

/// Reads a `roomReaction` event. `own_client_id` decides `is_self`.
pub fn decode_reaction<C: Codec>(
    codec: &C,
    own_client_id: &str,
    event: &ChannelEvent,
) -> Result<Reaction, ProtocolError> {
    let payload: ReactionPayload = codec.decode(&event.data)?;
    let client_id = event.client_id.clone().unwrap_or_default();
    Ok(Reaction {
        kind: payload.kind,
        metadata: payload.metadata,
        headers: headers_of(event),
        is_self: client_id == own_client_id,
        client_id,
        created_at: event.timestamp,
    })
}

/// Maps a transport presence message to the chat-level event.
pub fn presence_event(message: PresenceMessage) -> PresenceEvent {
    PresenceEvent {
        action: message.action,
        client_id: message.client_id,
        data: message.data,
        timestamp: message.timestamp,
    }
}

#[cfg(test)]
mod tests {
    use parley_transport::Serial;

    use super::*;

    #[test]
    fn test_message_event_carries_headers_in_extras() {
        let codec = JsonCodec;
        let mut headers = Headers::new();
        headers.insert("lang".into(), "en".into());
        let payload = MessagePayload {
            text: "hello".into(),
            metadata: Default::default(),
        };

        let mut event = encode_message(&codec, &payload, &headers).unwrap();
        assert_eq!(event.name, events::MESSAGE_CREATED);

        event.serial = Some(Serial::new("0001"));
        event.client_id = Some("alice".into());
        event.timestamp = 42;
        let message = decode_message(&codec, "lobby", &event).unwrap();
        assert_eq!(message.text, "hello");
        assert_eq!(message.room_id, "lobby");
        assert_eq!(message.created_at, 42);
        assert_eq!(message.headers.get("lang").and_then(|v| v.as_str()), Some("en"));
    }

    #[test]
    fn test_decode_message_without_serial_is_invalid() {
        let codec = JsonCodec;
        let event = ChannelEvent::new(events::MESSAGE_CREATED, serde_json::json!({"text": "x"}));
        let err = decode_message(&codec, "lobby", &event).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidEvent(_)));
    }

    #[test]
    fn test_decode_message_with_wrong_body_fails() {
        let codec = JsonCodec;
        let mut event = ChannelEvent::new(events::MESSAGE_CREATED, serde_json::json!(42));
        event.serial = Some(Serial::new("1"));
        let err = decode_message(&codec, "lobby", &event).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn test_reaction_is_self_follows_client_id() {
        let codec = JsonCodec;
        let params = SendReactionParams {
            kind: "heart".into(),
            ..Default::default()
        };
        let mut event = encode_reaction(&codec, &params).unwrap();
        event.client_id = Some("alice".into());

        assert!(decode_reaction(&codec, "alice", &event).unwrap().is_self);
        assert!(!decode_reaction(&codec, "bob", &event).unwrap().is_self);
    }
}
