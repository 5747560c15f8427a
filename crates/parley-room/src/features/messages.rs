//! Chat messages and subscription points.
//!
//! Every message subscription remembers the channel serial it started
//! observing from, its *subscription point*. "Messages before I
//! subscribed" queries are bounded by that serial. When the channel
//! reattaches without resuming, whatever the subscriber saw before is no
//! longer continuous with what it sees now, so every subscription point is
//! moved to the serial of the new attachment in one step.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use parley_protocol::{
    ErrorInfo, JsonCodec, Message, MessageEvent, MessageEventType, OrderBy, PaginatedResult,
    QueryOptions, SendMessageParams, Serial, decode_message, events,
};
use parley_transport::{Channel, ChannelEvent, ChannelManager, ChannelState, ChannelStateChange};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::contributor::FeatureChannel;
use crate::{ChatApi, Contributor, Feature, RoomError};

const MESSAGE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Subscription points
// ---------------------------------------------------------------------------

/// Per-subscriber subscription points.
///
/// A point is `None` until the channel attaches. Registration and rebasing
/// take the same lock, so a subscriber is either rebased or registered
/// with the new serial, never left on the old one.
#[derive(Default)]
pub(crate) struct SubscriptionPoints {
    next_id: AtomicU64,
    points: Mutex<HashMap<u64, watch::Sender<Option<Serial>>>>,
}

impl SubscriptionPoints {
    pub(crate) fn register(&self, channel: &dyn Channel) -> (u64, watch::Receiver<Option<Serial>>) {
        let mut points = self.points.lock();
        let initial = if channel.state() == ChannelState::Attached {
            channel.attach_serial()
        } else {
            None
        };
        let (tx, rx) = watch::channel(initial);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        points.insert(id, tx);
        (id, rx)
    }

    pub(crate) fn remove(&self, id: u64) {
        self.points.lock().remove(&id);
    }

    pub(crate) fn clear(&self) {
        self.points.lock().clear();
    }

    /// Moves every subscriber to `serial`.
    pub(crate) fn rebase(&self, serial: &Serial) {
        let points = self.points.lock();
        for point in points.values() {
            point.send_replace(Some(serial.clone()));
        }
        tracing::debug!(%serial, subscribers = points.len(), "subscription points rebased");
    }

    /// Resolves subscribers still waiting for an attachment to `serial`.
    pub(crate) fn resolve_pending(&self, serial: &Serial) {
        let points = self.points.lock();
        for point in points.values() {
            point.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                *current = Some(serial.clone());
                true
            });
        }
    }

    fn on_state_change(&self, change: &ChannelStateChange) {
        if change.current != ChannelState::Attached {
            return;
        }
        let Some(serial) = &change.attach_serial else {
            tracing::warn!("attached without an attach serial; subscription points unchanged");
            return;
        };
        if change.resumed {
            self.resolve_pending(serial);
        } else {
            self.rebase(serial);
        }
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// Sending, fetching, and subscribing to a room's messages.
pub struct Messages {
    room: String,
    base: FeatureChannel,
    api: Arc<dyn ChatApi>,
    points: Arc<SubscriptionPoints>,
    events: broadcast::Sender<MessageEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Messages {
    pub(crate) fn new(room: &str, channels: Arc<ChannelManager>, api: Arc<dyn ChatApi>) -> Arc<Self> {
        let base = FeatureChannel::acquire(Feature::Messages, room, channels);
        let points = Arc::new(SubscriptionPoints::default());
        let (events, _) = broadcast::channel(MESSAGE_CAPACITY);

        // Subscribe before spawning so nothing published in between is
        // missed.
        let states = base.channel().on_state_change();
        let incoming = base.channel().subscribe();
        let listener = tokio::spawn(listen(
            room.to_owned(),
            Arc::clone(base.channel()),
            states,
            incoming,
            Arc::clone(&points),
            events.clone(),
        ));

        Arc::new(Self {
            room: room.to_owned(),
            base,
            api,
            points,
            events,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Sends a message. Resolves with the message as stored by the service.
    pub async fn send(&self, params: SendMessageParams) -> Result<Message, RoomError> {
        self.api
            .send_message(&self.room, &params)
            .await
            .map_err(RoomError::Api)
    }

    /// Fetches a page of message history.
    pub async fn get(&self, query: QueryOptions) -> Result<PaginatedResult<Message>, RoomError> {
        self.api
            .get_messages(&self.room, &query)
            .await
            .map_err(RoomError::Api)
    }

    /// Subscribes to new messages.
    pub fn subscribe(&self) -> MessageSubscription {
        let events = self.events.subscribe();
        let (id, point) = self.points.register(self.base.channel().as_ref());
        tracing::debug!(room = %self.room, subscription = id, "message subscription added");
        MessageSubscription {
            id,
            room: self.room.clone(),
            events,
            point,
            points: Arc::clone(&self.points),
            api: Arc::clone(&self.api),
            unsubscribed: false,
        }
    }

    /// Subscribes to discontinuities on the messages channel.
    pub fn on_discontinuity(&self) -> broadcast::Receiver<ErrorInfo> {
        self.base.on_discontinuity()
    }
}

#[async_trait]
impl Contributor for Messages {
    fn feature(&self) -> Feature {
        Feature::Messages
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        self.base.channel()
    }

    async fn release(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.points.clear();
        self.base.release().await;
    }

    fn discontinuity_detected(&self, reason: ErrorInfo) {
        self.base.discontinuity_detected(reason);
    }
}

async fn listen(
    room: String,
    channel: Arc<dyn Channel>,
    mut states: broadcast::Receiver<ChannelStateChange>,
    mut incoming: broadcast::Receiver<ChannelEvent>,
    points: Arc<SubscriptionPoints>,
    events: broadcast::Sender<MessageEvent>,
) {
    let codec = JsonCodec;
    loop {
        tokio::select! {
            change = states.recv() => match change {
                Ok(change) => points.on_state_change(&change),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(room = %room, skipped, "message listener lagged on state changes");
                    if channel.state() == ChannelState::Attached {
                        if let Some(serial) = channel.attach_serial() {
                            points.resolve_pending(&serial);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            event = incoming.recv() => match event {
                Ok(event) if event.name == events::MESSAGE_CREATED => {
                    match decode_message(&codec, &room, &event) {
                        Ok(message) => {
                            let _ = events.send(MessageEvent {
                                kind: MessageEventType::Created,
                                message,
                            });
                        }
                        Err(e) => tracing::warn!(room = %room, error = %e, "dropping undecodable message"),
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(room = %room, skipped, "message listener lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    tracing::debug!(room = %room, "message listener stopped");
}

// ---------------------------------------------------------------------------
// MessageSubscription
// ---------------------------------------------------------------------------

/// A live subscription to a room's messages.
///
/// Dropping the subscription unsubscribes it.
pub struct MessageSubscription {
    id: u64,
    room: String,
    events: broadcast::Receiver<MessageEvent>,
    point: watch::Receiver<Option<Serial>>,
    points: Arc<SubscriptionPoints>,
    api: Arc<dyn ChatApi>,
    unsubscribed: bool,
}

impl MessageSubscription {
    /// Waits for the next message event. Returns `None` once unsubscribed
    /// or once the room is released.
    pub async fn recv(&mut self) -> Option<MessageEvent> {
        if self.unsubscribed {
            return None;
        }
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(room = %self.room, subscription = self.id, skipped, "subscription lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// The serial this subscription started observing from, if the channel
    /// has attached.
    pub fn subscription_point(&self) -> Option<Serial> {
        self.point.borrow().clone()
    }

    /// Fetches messages sent before this subscription's point, newest
    /// first.
    ///
    /// Waits for the point to resolve if the channel has not attached yet.
    /// `from_serial` and `order_by` in `query` are overridden.
    pub async fn get_previous_messages(
        &self,
        mut query: QueryOptions,
    ) -> Result<PaginatedResult<Message>, RoomError> {
        if self.unsubscribed {
            return Err(RoomError::AlreadyUnsubscribed);
        }

        let mut point = self.point.clone();
        let serial = point
            .wait_for(Option::is_some)
            .await
            .map_err(|_| RoomError::AlreadyUnsubscribed)?
            .clone();

        query.from_serial = serial;
        query.order_by = OrderBy::NewestFirst;
        self.api
            .get_messages(&self.room, &query)
            .await
            .map_err(RoomError::Api)
    }

    /// Stops the subscription. Later queries fail with
    /// [`RoomError::AlreadyUnsubscribed`].
    pub fn unsubscribe(&mut self) {
        if !self.unsubscribed {
            self.unsubscribed = true;
            self.points.remove(self.id);
            tracing::debug!(room = %self.room, subscription = self.id, "message subscription removed");
        }
    }
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        self.points.remove(self.id);
    }
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use std::time::Duration;

    use parley_transport::LocalTransport;

    use super::*;
    use crate::LocalChatApi;

    struct Fixture {
        transport: Arc<LocalTransport>,
        api: Arc<LocalChatApi>,
        messages: Arc<Messages>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(LocalTransport::new("alice"));
        let channels = Arc::new(ChannelManager::new(transport.clone()));
        let api = Arc::new(LocalChatApi::new(transport.clone()));
        let messages = Messages::new("lobby", channels, api.clone());
        Fixture {
            transport,
            api,
            messages,
        }
    }

    impl Fixture {
        fn channel(&self) -> Arc<parley_transport::LocalChannel> {
            self.transport.local_channel("lobby::$chat::$chatMessages")
        }
    }

    async fn point_becomes(sub: &MessageSubscription, expected: &Serial) {
        let mut point = sub.point.clone();
        tokio::time::timeout(
            Duration::from_secs(1),
            point.wait_for(|p| p.as_ref() == Some(expected)),
        )
        .await
        .expect("subscription point did not change")
        .unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_while_attached_uses_attach_serial() {
        let f = fixture();
        f.channel().attach().await.unwrap();
        let serial = f.channel().attach_serial().unwrap();

        let sub = f.messages.subscribe();
        assert_eq!(sub.subscription_point(), Some(serial));
    }

    #[tokio::test]
    async fn test_subscribe_before_attach_resolves_on_attach() {
        let f = fixture();
        let sub = f.messages.subscribe();
        assert_eq!(sub.subscription_point(), None);

        f.channel().attach().await.unwrap();
        let serial = f.channel().attach_serial().unwrap();
        point_becomes(&sub, &serial).await;
    }

    #[tokio::test]
    async fn test_non_resumed_reattach_rebases_every_subscriber() {
        let f = fixture();
        f.channel().attach().await.unwrap();
        let a = f.messages.subscribe();
        let b = f.messages.subscribe();
        let before = a.subscription_point().unwrap();

        f.channel().emit_state(ChannelState::Attached, false, None);
        let after = f.channel().attach_serial().unwrap();
        assert_ne!(before, after);

        point_becomes(&a, &after).await;
        point_becomes(&b, &after).await;
    }

    #[tokio::test]
    async fn test_resumed_reattach_only_resolves_pending() {
        let f = fixture();
        f.channel().attach().await.unwrap();
        let resolved = f.messages.subscribe();
        let original = resolved.subscription_point().unwrap();

        f.channel().emit_state(ChannelState::Suspended, false, None);
        let pending = f.messages.subscribe();
        assert_eq!(pending.subscription_point(), None);

        f.channel().emit_state(ChannelState::Attached, true, None);
        let resumed_at = f.channel().attach_serial().unwrap();
        point_becomes(&pending, &resumed_at).await;
        assert_eq!(resolved.subscription_point(), Some(original));
    }

    #[tokio::test]
    async fn test_previous_messages_wait_for_attach() {
        let f = fixture();
        f.api.send_message("lobby", &SendMessageParams::text("one")).await.unwrap();
        f.api.send_message("lobby", &SendMessageParams::text("two")).await.unwrap();

        let sub = f.messages.subscribe();
        let channel = f.channel();
        let api = f.api.clone();
        let (page, _) = tokio::join!(sub.get_previous_messages(QueryOptions::default()), async {
            channel.attach().await.unwrap();
            api.send_message("lobby", &SendMessageParams::text("after"))
                .await
                .unwrap();
        });

        let texts: Vec<_> = page.unwrap().items.into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["two", "one"]);
    }

    #[tokio::test]
    async fn test_previous_messages_after_unsubscribe_fails() {
        let f = fixture();
        f.channel().attach().await.unwrap();
        let mut sub = f.messages.subscribe();
        sub.unsubscribe();

        let err = sub
            .get_previous_messages(QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::AlreadyUnsubscribed));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_subscriber_receives_sent_messages() {
        let f = fixture();
        f.channel().attach().await.unwrap();
        let mut sub = f.messages.subscribe();

        let sent = f.messages.send(SendMessageParams::text("hello")).await.unwrap();
        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, MessageEventType::Created);
        assert_eq!(event.message, sent);
    }

    #[tokio::test]
    async fn test_release_ends_subscriptions() {
        let f = fixture();
        let sub = f.messages.subscribe();
        f.messages.release().await;

        let err = sub
            .get_previous_messages(QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::AlreadyUnsubscribed));
        assert_eq!(f.transport.released(), vec!["lobby::$chat::$chatMessages".to_string()]);
    }
}
