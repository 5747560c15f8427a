//! In-memory chat API over a [`LocalTransport`].
//!
//! Sent messages are published on the room's messages channel, the same
//! way the service fans them out, and kept in a per-room history that
//! `get_messages` pages through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_protocol::{
    ErrorCode, ErrorInfo, JsonCodec, Message, MessagePayload, OccupancyEvent, OrderBy,
    PaginatedResult, QueryOptions, SendMessageParams, decode_message, encode_message,
};
use parley_transport::{ChannelProvider, LocalTransport};

use crate::{ChatApi, Feature};

/// A [`ChatApi`] backed by a [`LocalTransport`].
pub struct LocalChatApi {
    transport: Arc<LocalTransport>,
    codec: JsonCodec,
    history: Mutex<HashMap<String, Vec<Message>>>,
    occupancy: Mutex<HashMap<String, OccupancyEvent>>,
}

impl LocalChatApi {
    /// Creates an API publishing through `transport`.
    pub fn new(transport: Arc<LocalTransport>) -> Self {
        Self {
            transport,
            codec: JsonCodec,
            history: Mutex::new(HashMap::new()),
            occupancy: Mutex::new(HashMap::new()),
        }
    }

    /// Sets what `get_occupancy` reports for `room`.
    pub fn set_occupancy(&self, room: &str, occupancy: OccupancyEvent) {
        self.occupancy.lock().insert(room.to_owned(), occupancy);
    }

    /// Every message sent to `room`, oldest first.
    pub fn history(&self, room: &str) -> Vec<Message> {
        self.history.lock().get(room).cloned().unwrap_or_default()
    }
}

fn bad_request(e: impl std::fmt::Display) -> ErrorInfo {
    ErrorCode::BadRequest.info(e.to_string())
}

#[async_trait]
impl ChatApi for LocalChatApi {
    async fn get_messages(
        &self,
        room: &str,
        query: &QueryOptions,
    ) -> Result<PaginatedResult<Message>, ErrorInfo> {
        let mut items: Vec<Message> = self
            .history(room)
            .into_iter()
            .filter(|m| query.from_serial.as_ref().is_none_or(|s| m.serial < *s))
            .filter(|m| query.start.is_none_or(|start| m.created_at >= start))
            .filter(|m| query.end.is_none_or(|end| m.created_at <= end))
            .collect();

        if query.order_by == OrderBy::NewestFirst {
            items.reverse();
        }
        let has_next = query.limit.is_some_and(|limit| items.len() > limit);
        if let Some(limit) = query.limit {
            items.truncate(limit);
        }
        Ok(PaginatedResult { items, has_next })
    }

    async fn send_message(
        &self,
        room: &str,
        params: &SendMessageParams,
    ) -> Result<Message, ErrorInfo> {
        if params.text.is_empty() {
            return Err(ErrorCode::BadRequest.info("message text must not be empty"));
        }
        let payload = MessagePayload {
            text: params.text.clone(),
            metadata: params.metadata.clone(),
        };
        let mut event = encode_message(&self.codec, &payload, &params.headers).map_err(bad_request)?;
        event.client_id = Some(self.transport.client_id());

        let channel = self
            .transport
            .local_channel(&Feature::Messages.channel_name(room));
        let event = channel.deliver(event);
        let message = decode_message(&self.codec, room, &event).map_err(bad_request)?;

        self.history
            .lock()
            .entry(room.to_owned())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn get_occupancy(&self, room: &str) -> Result<OccupancyEvent, ErrorInfo> {
        Ok(self.occupancy.lock().get(room).copied().unwrap_or_default())
    }
}
