//! Error types for the protocol layer.
//!
//! A `ProtocolError` always means a payload did not have the shape the
//! chat layer expected. It never means the channel or the room is broken.

/// Errors that can occur while encoding or decoding chat payloads.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A payload could not be turned into JSON.
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// A channel event's data did not match the expected payload.
    ///
    /// Usually a malformed event from another client, or an event with
    /// the right name but the wrong body.
    #[error("decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    /// The event decoded but is missing something the transport should
    /// have stamped, such as its serial.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}
