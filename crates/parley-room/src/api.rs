//! The chat REST API seam.
//!
//! History and occupancy are fetched over request/response rather than the
//! realtime channel. [`ChatApi`] is what the room features need from that
//! side; the HTTP client behind it is supplied by the application.

use async_trait::async_trait;
use parley_protocol::{
    ErrorInfo, Message, OccupancyEvent, PaginatedResult, QueryOptions, SendMessageParams,
};

/// Request/response calls made by room features.
#[async_trait]
pub trait ChatApi: Send + Sync + 'static {
    /// Fetches a page of a room's message history.
    async fn get_messages(
        &self,
        room: &str,
        query: &QueryOptions,
    ) -> Result<PaginatedResult<Message>, ErrorInfo>;

    /// Sends a message to a room and returns it as stored.
    async fn send_message(
        &self,
        room: &str,
        params: &SendMessageParams,
    ) -> Result<Message, ErrorInfo>;

    /// Fetches a room's current occupancy.
    async fn get_occupancy(&self, room: &str) -> Result<OccupancyEvent, ErrorInfo>;
}
