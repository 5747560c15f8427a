//! Typing indicators.
//!
//! Typing is presence on a dedicated channel: a client that is typing is
//! a member of that channel's presence set. `start` enters and arms a
//! timer; if `start` is not called again before the timer fires, the
//! client leaves on its own.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_protocol::{ErrorInfo, TypingEvent};
use parley_transport::{Channel, ChannelManager, PresenceMessage};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::contributor::FeatureChannel;
use crate::options::TypingOptions;
use crate::{Contributor, Feature, RoomError};

/// Who is typing in a room.
pub struct Typing {
    room: String,
    base: FeatureChannel,
    timeout: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Typing {
    pub(crate) fn new(room: &str, channels: Arc<ChannelManager>, options: TypingOptions) -> Arc<Self> {
        Arc::new(Self {
            room: room.to_owned(),
            base: FeatureChannel::acquire(Feature::Typing, room, channels),
            timeout: options.timeout,
            timer: Mutex::new(None),
        })
    }

    /// Marks this client as typing. Calling again while typing only
    /// extends the timeout.
    pub async fn start(&self) -> Result<(), RoomError> {
        let already_typing = self
            .timer
            .lock()
            .as_ref()
            .is_some_and(|timer| !timer.is_finished());
        if !already_typing {
            self.base.channel().enter_presence(None).await?;
            tracing::debug!(room = %self.room, "typing started");
        }

        let channel = Arc::clone(self.base.channel());
        let room = self.room.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Err(e) = channel.leave_presence(None).await {
                tracing::warn!(room = %room, error = %e, "failed to stop typing after timeout");
            } else {
                tracing::debug!(room = %room, "typing timed out");
            }
        });
        if let Some(previous) = self.timer.lock().replace(timer) {
            previous.abort();
        }
        Ok(())
    }

    /// Marks this client as no longer typing.
    pub async fn stop(&self) -> Result<(), RoomError> {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.base.channel().leave_presence(None).await?;
        tracing::debug!(room = %self.room, "typing stopped");
        Ok(())
    }

    /// Client ids of everyone currently typing.
    pub async fn get(&self) -> Result<BTreeSet<String>, RoomError> {
        typing_clients(self.base.channel().as_ref()).await
    }

    /// Subscribes to changes in who is typing.
    pub fn subscribe(&self) -> TypingSubscription {
        TypingSubscription {
            channel: Arc::clone(self.base.channel()),
            messages: self.base.channel().on_presence(),
        }
    }

    /// Subscribes to discontinuities on the typing channel.
    pub fn on_discontinuity(&self) -> broadcast::Receiver<ErrorInfo> {
        self.base.on_discontinuity()
    }
}

async fn typing_clients(channel: &dyn Channel) -> Result<BTreeSet<String>, RoomError> {
    let members = channel.presence_members().await?;
    Ok(members.into_iter().map(|m| m.client_id).collect())
}

#[async_trait]
impl Contributor for Typing {
    fn feature(&self) -> Feature {
        Feature::Typing
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        self.base.channel()
    }

    async fn release(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        self.base.release().await;
    }

    fn discontinuity_detected(&self, reason: ErrorInfo) {
        self.base.discontinuity_detected(reason);
    }
}

/// A live subscription to typing changes.
///
/// Each event carries the full set of typing clients after the change.
pub struct TypingSubscription {
    channel: Arc<dyn Channel>,
    messages: broadcast::Receiver<PresenceMessage>,
}

impl TypingSubscription {
    /// Waits for the next change in who is typing.
    pub async fn recv(&mut self) -> Option<TypingEvent> {
        loop {
            match self.messages.recv().await {
                Ok(_) => break,
                Err(RecvError::Lagged(skipped)) => {
                    // The set is recomputed from scratch, so missed
                    // messages do not matter.
                    tracing::trace!(skipped, "typing subscriber lagged");
                    break;
                }
                Err(RecvError::Closed) => return None,
            }
        }
        match typing_clients(self.channel.as_ref()).await {
            Ok(currently_typing) => Some(TypingEvent { currently_typing }),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read typing set");
                None
            }
        }
    }
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use parley_protocol::PresenceAction;
    use parley_transport::LocalTransport;

    use super::*;

    fn typing(timeout: Duration) -> (Arc<LocalTransport>, Arc<Typing>) {
        let transport = Arc::new(LocalTransport::new("alice"));
        let channels = Arc::new(ChannelManager::new(transport.clone()));
        (transport, Typing::new("lobby", channels, TypingOptions { timeout }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_then_timeout_stops_typing() {
        let (_transport, typing) = typing(Duration::from_secs(5));
        typing.start().await.unwrap();
        assert_eq!(typing.get().await.unwrap(), BTreeSet::from(["alice".to_string()]));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(typing.get().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_again_extends_timeout() {
        let (_transport, typing) = typing(Duration::from_secs(5));
        typing.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        typing.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!typing.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_leaves_immediately() {
        let (_transport, typing) = typing(Duration::from_secs(5));
        typing.start().await.unwrap();
        typing.stop().await.unwrap();
        assert!(typing.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_reports_full_set() {
        let (transport, typing) = typing(Duration::from_secs(5));
        let mut sub = typing.subscribe();

        transport
            .local_channel("lobby::$chat::$typingIndicators")
            .simulate_presence(PresenceMessage {
                action: PresenceAction::Enter,
                client_id: "bob".into(),
                data: None,
                timestamp: 1,
            });
        typing.start().await.unwrap();

        let first = sub.recv().await.unwrap();
        assert!(first.currently_typing.contains("bob"));
        let second = sub.recv().await.unwrap();
        assert_eq!(
            second.currently_typing,
            BTreeSet::from(["alice".to_string(), "bob".to_string()])
        );
    }
}
