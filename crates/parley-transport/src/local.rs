//! In-memory transport.
//!
//! `LocalTransport` behaves like a single connection to a realtime service
//! where every channel lives in this process. Attach and detach succeed
//! immediately unless a test arms a failure or holds the operation behind
//! an [`OperationGate`]. Transport-driven changes (suspension, resumed or
//! non-resumed reattachment) are injected with [`LocalChannel::emit_state`].
//!
//! Serials come from one transport-wide counter, so attach serials and
//! event serials share an ordering.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, oneshot};

use crate::{
    Channel, ChannelEvent, ChannelProvider, ChannelState, ChannelStateChange, ErrorInfo,
    PresenceAction, PresenceMessage, Serial, TransportError,
};

const STATE_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

// ---------------------------------------------------------------------------
// LocalTransport
// ---------------------------------------------------------------------------

/// An in-process [`ChannelProvider`].
pub struct LocalTransport {
    client_id: String,
    serials: Arc<AtomicU64>,
    channels: Mutex<HashMap<String, Arc<LocalChannel>>>,
    released: Mutex<Vec<String>>,
}

impl LocalTransport {
    /// Creates a transport whose connection identifies as `client_id`.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            serials: Arc::new(AtomicU64::new(1)),
            channels: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Creates a transport with a random client id.
    pub fn with_random_client_id() -> Self {
        let id: u64 = rand::rng().random();
        Self::new(format!("parley-{id:016x}"))
    }

    /// Returns the concrete channel for `name`, creating it if needed.
    pub fn local_channel(&self, name: &str) -> Arc<LocalChannel> {
        let mut channels = self.channels.lock();
        let channel = channels.entry(name.to_owned()).or_insert_with(|| {
            Arc::new(LocalChannel::new(name, &self.client_id, Arc::clone(&self.serials)))
        });
        Arc::clone(channel)
    }

    /// Names of channels released so far, in release order.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

impl ChannelProvider for LocalTransport {
    fn channel(&self, name: &str) -> Arc<dyn Channel> {
        self.local_channel(name)
    }

    fn release(&self, name: &str) {
        self.channels.lock().remove(name);
        self.released.lock().push(name.to_owned());
        tracing::debug!(channel = name, "local channel released");
    }

    fn client_id(&self) -> String {
        self.client_id.clone()
    }
}

// ---------------------------------------------------------------------------
// OperationGate
// ---------------------------------------------------------------------------

/// Holds the next attach or detach of a [`LocalChannel`] until opened.
///
/// Dropping the gate opens it.
pub struct OperationGate(oneshot::Sender<()>);

impl OperationGate {
    /// Lets the held operation proceed.
    pub fn open(self) {
        let _ = self.0.send(());
    }
}

// ---------------------------------------------------------------------------
// LocalChannel
// ---------------------------------------------------------------------------

struct Inner {
    state: ChannelState,
    reason: Option<ErrorInfo>,
    attach_serial: Option<Serial>,
    attach_calls: usize,
    detach_calls: usize,
    fail_attach: Option<(ChannelState, ErrorInfo)>,
    fail_detach: Option<ErrorInfo>,
    attach_gate: Option<oneshot::Receiver<()>>,
    detach_gate: Option<oneshot::Receiver<()>>,
    members: BTreeMap<String, PresenceMessage>,
}

/// A channel of a [`LocalTransport`].
pub struct LocalChannel {
    name: String,
    client_id: String,
    serials: Arc<AtomicU64>,
    inner: Mutex<Inner>,
    states: broadcast::Sender<ChannelStateChange>,
    events: broadcast::Sender<ChannelEvent>,
    presence: broadcast::Sender<PresenceMessage>,
}

impl LocalChannel {
    fn new(name: &str, client_id: &str, serials: Arc<AtomicU64>) -> Self {
        Self {
            name: name.to_owned(),
            client_id: client_id.to_owned(),
            serials,
            inner: Mutex::new(Inner {
                state: ChannelState::Initialized,
                reason: None,
                attach_serial: None,
                attach_calls: 0,
                detach_calls: 0,
                fail_attach: None,
                fail_detach: None,
                attach_gate: None,
                detach_gate: None,
                members: BTreeMap::new(),
            }),
            states: broadcast::channel(STATE_CAPACITY).0,
            events: broadcast::channel(EVENT_CAPACITY).0,
            presence: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    fn next_serial(&self) -> Serial {
        let n = self.serials.fetch_add(1, Ordering::Relaxed);
        Serial(format!("{n:020}"))
    }

    /// Applies a state change and publishes it. The send happens under the
    /// lock so listeners observe changes in the order they were applied.
    fn transition(&self, current: ChannelState, resumed: bool, reason: Option<ErrorInfo>) {
        let serial = (current == ChannelState::Attached).then(|| self.next_serial());
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = current;
        inner.attach_serial = serial.clone();
        inner.reason = match current {
            ChannelState::Suspended | ChannelState::Failed => reason.clone(),
            _ => None,
        };
        tracing::trace!(channel = %self.name, %previous, %current, resumed, "local channel state");
        let _ = self.states.send(ChannelStateChange {
            previous,
            current,
            resumed,
            reason,
            attach_serial: serial,
        });
    }

    /// Simulates a transport-driven state change, such as the connection
    /// dropping (`Suspended`) or the channel reattaching on its own
    /// (`Attached`, with `resumed` saying whether continuity survived).
    pub fn emit_state(&self, current: ChannelState, resumed: bool, reason: Option<ErrorInfo>) {
        self.transition(current, resumed, reason);
    }

    /// Makes the next attach end in `state` (`Failed` or `Suspended`) with
    /// `reason`.
    pub fn fail_next_attach(&self, state: ChannelState, reason: ErrorInfo) {
        self.inner.lock().fail_attach = Some((state, reason));
    }

    /// Makes the next detach fail, leaving the channel `Failed`.
    pub fn fail_next_detach(&self, reason: ErrorInfo) {
        self.inner.lock().fail_detach = Some(reason);
    }

    /// Holds the next attach until the returned gate is opened.
    pub fn hold_attach(&self) -> OperationGate {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().attach_gate = Some(rx);
        OperationGate(tx)
    }

    /// Holds the next detach until the returned gate is opened.
    pub fn hold_detach(&self) -> OperationGate {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().detach_gate = Some(rx);
        OperationGate(tx)
    }

    /// Number of `attach` calls made so far, including no-ops.
    pub fn attach_calls(&self) -> usize {
        self.inner.lock().attach_calls
    }

    /// Number of `detach` calls made so far, including no-ops.
    pub fn detach_calls(&self) -> usize {
        self.inner.lock().detach_calls
    }

    /// Stamps `event` with a serial and timestamp and delivers it to
    /// subscribers. Returns the stamped event.
    pub fn deliver(&self, mut event: ChannelEvent) -> ChannelEvent {
        if event.serial.is_none() {
            event.serial = Some(self.next_serial());
        }
        if event.timestamp == 0 {
            event.timestamp = now_millis();
        }
        let _ = self.events.send(event.clone());
        event
    }

    /// Applies a presence message from another client.
    pub fn simulate_presence(&self, message: PresenceMessage) {
        self.apply_presence(message);
    }

    fn apply_presence(&self, message: PresenceMessage) {
        let mut inner = self.inner.lock();
        match message.action {
            PresenceAction::Leave => {
                if inner.members.remove(&message.client_id).is_none() {
                    return;
                }
            }
            _ => {
                let mut member = message.clone();
                member.action = PresenceAction::Present;
                inner.members.insert(message.client_id.clone(), member);
            }
        }
        let _ = self.presence.send(message);
    }

    fn own_presence(&self, action: PresenceAction, data: Option<serde_json::Value>) -> PresenceMessage {
        PresenceMessage {
            action,
            client_id: self.client_id.clone(),
            data,
            timestamp: now_millis(),
        }
    }
}

#[async_trait]
impl Channel for LocalChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.lock().reason.clone()
    }

    fn attach_serial(&self) -> Option<Serial> {
        self.inner.lock().attach_serial.clone()
    }

    fn on_state_change(&self) -> broadcast::Receiver<ChannelStateChange> {
        self.states.subscribe()
    }

    async fn attach(&self) -> Result<(), TransportError> {
        let gate = {
            let mut inner = self.inner.lock();
            inner.attach_calls += 1;
            if inner.state == ChannelState::Attached {
                return Ok(());
            }
            inner.attach_gate.take()
        };

        self.transition(ChannelState::Attaching, false, None);
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let failure = self.inner.lock().fail_attach.take();
        if let Some((state, reason)) = failure {
            self.transition(state, false, Some(reason.clone()));
            return Err(TransportError::AttachFailed {
                channel: self.name.clone(),
                reason,
            });
        }

        self.transition(ChannelState::Attached, false, None);
        Ok(())
    }

    async fn detach(&self) -> Result<(), TransportError> {
        let gate = {
            let mut inner = self.inner.lock();
            inner.detach_calls += 1;
            inner.detach_gate.take()
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let (state, failure) = {
            let mut inner = self.inner.lock();
            (inner.state, inner.fail_detach.take())
        };
        if let Some(reason) = failure {
            self.transition(ChannelState::Failed, false, Some(reason.clone()));
            return Err(TransportError::DetachFailed {
                channel: self.name.clone(),
                reason,
            });
        }

        match state {
            ChannelState::Initialized | ChannelState::Detached => Ok(()),
            _ => {
                self.transition(ChannelState::Detaching, false, None);
                self.transition(ChannelState::Detached, false, None);
                Ok(())
            }
        }
    }

    async fn publish(&self, mut event: ChannelEvent) -> Result<(), TransportError> {
        event.client_id = Some(self.client_id.clone());
        self.deliver(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn enter_presence(&self, data: Option<serde_json::Value>) -> Result<(), TransportError> {
        self.apply_presence(self.own_presence(PresenceAction::Enter, data));
        Ok(())
    }

    async fn update_presence(&self, data: Option<serde_json::Value>) -> Result<(), TransportError> {
        self.apply_presence(self.own_presence(PresenceAction::Update, data));
        Ok(())
    }

    async fn leave_presence(&self, data: Option<serde_json::Value>) -> Result<(), TransportError> {
        self.apply_presence(self.own_presence(PresenceAction::Leave, data));
        Ok(())
    }

    async fn presence_members(&self) -> Result<Vec<PresenceMessage>, TransportError> {
        Ok(self.inner.lock().members.values().cloned().collect())
    }

    fn on_presence(&self) -> broadcast::Receiver<PresenceMessage> {
        self.presence.subscribe()
    }
}
