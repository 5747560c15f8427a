//! The five room features.
//!
//! Each feature is a [`Contributor`](crate::Contributor) the lifecycle
//! manager drives, plus the API callers use once the room is attached.

mod messages;
mod occupancy;
mod presence;
mod reactions;
mod typing;

pub use messages::{MessageSubscription, Messages};
pub use occupancy::Occupancy;
pub use presence::{Presence, PresenceSubscription};
pub use reactions::Reactions;
pub use typing::{Typing, TypingSubscription};

use parley_transport::ChannelEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

type Decoder<T> = Box<dyn Fn(&ChannelEvent) -> Option<T> + Send + Sync>;

/// A stream of decoded channel events.
///
/// Events the decoder rejects are skipped.
pub struct EventSubscription<T> {
    events: broadcast::Receiver<ChannelEvent>,
    decode: Decoder<T>,
}

impl<T> EventSubscription<T> {
    pub(crate) fn new(
        events: broadcast::Receiver<ChannelEvent>,
        decode: impl Fn(&ChannelEvent) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            events,
            decode: Box::new(decode),
        }
    }

    /// Waits for the next event. Returns `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.events.recv().await {
                Ok(event) => {
                    if let Some(item) = (self.decode)(&event) {
                        return Some(item);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
