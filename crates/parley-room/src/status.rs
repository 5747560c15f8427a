//! Room status state machine and change notification.

use parking_lot::Mutex;
use parley_protocol::ErrorInfo;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

// ---------------------------------------------------------------------------
// RoomStatus
// ---------------------------------------------------------------------------

/// The lifecycle status of a room.
///
/// ```text
/// Initialized → Attaching → Attached ⇄ Suspended
///                   │          │           │
///                   ▼          ▼           ▼
///                 Failed   Detaching → Detached
///
/// any (except Released) → Releasing → Released
/// ```
///
/// - **Initialized**: created, nothing attached yet. The only entry state.
/// - **Attaching** / **Detaching**: an attach or detach operation is running.
/// - **Attached**: every feature channel is attached.
/// - **Suspended**: a feature channel dropped; the room is retrying on its
///   own and will return to `Attached` if the transport recovers.
/// - **Failed**: the room cannot recover on its own; it should be released.
/// - **Releasing** / **Released**: being torn down / torn down. `Released`
///   is terminal.
///
/// Which transitions are allowed is decided by the lifecycle manager, not
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomStatus {
    Initialized,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Suspended,
    Failed,
    Releasing,
    Released,
}

impl RoomStatus {
    /// Returns `true` once the room is `Released`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released)
    }

    /// Returns `true` while the room is being or has been released.
    pub fn is_releasing_or_released(&self) -> bool {
        matches!(self, Self::Releasing | Self::Released)
    }
}

impl std::fmt::Display for RoomStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "Initialized"),
            Self::Attaching => write!(f, "Attaching"),
            Self::Attached => write!(f, "Attached"),
            Self::Detaching => write!(f, "Detaching"),
            Self::Detached => write!(f, "Detached"),
            Self::Suspended => write!(f, "Suspended"),
            Self::Failed => write!(f, "Failed"),
            Self::Releasing => write!(f, "Releasing"),
            Self::Released => write!(f, "Released"),
        }
    }
}

// ---------------------------------------------------------------------------
// RoomStatusChange
// ---------------------------------------------------------------------------

/// One status transition, as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStatusChange {
    /// The status after the change.
    pub current: RoomStatus,
    /// The status before the change.
    pub previous: RoomStatus,
    /// The error that caused the change, if any. Informational only.
    pub error: Option<ErrorInfo>,
}

// ---------------------------------------------------------------------------
// StatusMonitor
// ---------------------------------------------------------------------------

struct Current {
    status: RoomStatus,
    error: Option<ErrorInfo>,
    listeners: Vec<mpsc::UnboundedSender<RoomStatusChange>>,
}

/// Holds the current status and fans changes out to listeners.
///
/// Each listener has its own unbounded queue, so a slow listener never
/// loses a change. `set` publishes and `subscribe` registers under the same
/// lock: every listener sees changes in the order they were set, and a
/// listener that subscribes between two `set`s only sees the second.
pub(crate) struct StatusMonitor {
    room: String,
    current: Mutex<Current>,
}

impl StatusMonitor {
    pub(crate) fn new(room: &str) -> Self {
        Self {
            room: room.to_owned(),
            current: Mutex::new(Current {
                status: RoomStatus::Initialized,
                error: None,
                listeners: Vec::new(),
            }),
        }
    }

    pub(crate) fn status(&self) -> RoomStatus {
        self.current.lock().status
    }

    pub(crate) fn error(&self) -> Option<ErrorInfo> {
        self.current.lock().error.clone()
    }

    pub(crate) fn subscribe(&self) -> StatusSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.current.lock().listeners.push(tx);
        StatusSubscription { rx }
    }

    pub(crate) fn set(&self, status: RoomStatus, error: Option<ErrorInfo>) {
        let mut current = self.current.lock();
        let previous = current.status;
        current.status = status;
        current.error = error.clone();

        match &error {
            Some(e) => tracing::warn!(
                room = %self.room,
                %previous,
                current = %status,
                error = %e,
                "room status changed"
            ),
            None => tracing::info!(
                room = %self.room,
                %previous,
                current = %status,
                "room status changed"
            ),
        }

        let change = RoomStatusChange {
            current: status,
            previous,
            error,
        };
        // Dropped subscriptions are pruned here.
        current.listeners.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

// ---------------------------------------------------------------------------
// StatusSubscription
// ---------------------------------------------------------------------------

/// A listener's view of a room's status changes, from the moment it
/// subscribed. Changes queue until read; none are dropped.
#[derive(Debug)]
pub struct StatusSubscription {
    rx: mpsc::UnboundedReceiver<RoomStatusChange>,
}

impl StatusSubscription {
    /// Waits for the next change. Returns `None` once the room is gone and
    /// every queued change has been read.
    pub async fn recv(&mut self) -> Option<RoomStatusChange> {
        self.rx.recv().await
    }

    /// Returns the next queued change without waiting.
    pub fn try_recv(&mut self) -> Result<RoomStatusChange, TryRecvError> {
        self.rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::ErrorCode;

    use super::*;

    #[test]
    fn test_new_monitor_starts_initialized() {
        let monitor = StatusMonitor::new("lobby");
        assert_eq!(monitor.status(), RoomStatus::Initialized);
        assert_eq!(monitor.error(), None);
    }

    #[test]
    fn test_set_updates_current_and_error() {
        let monitor = StatusMonitor::new("lobby");
        let err = ErrorCode::PresenceAttachmentFailed.info("presence failed");
        monitor.set(RoomStatus::Failed, Some(err.clone()));
        assert_eq!(monitor.status(), RoomStatus::Failed);
        assert_eq!(monitor.error(), Some(err));
    }

    #[tokio::test]
    async fn test_listeners_receive_changes_in_order() {
        let monitor = StatusMonitor::new("lobby");
        let mut a = monitor.subscribe();
        let mut b = monitor.subscribe();

        monitor.set(RoomStatus::Attaching, None);
        monitor.set(RoomStatus::Attached, None);

        for rx in [&mut a, &mut b] {
            let first = rx.recv().await.unwrap();
            assert_eq!((first.previous, first.current), (RoomStatus::Initialized, RoomStatus::Attaching));
            let second = rx.recv().await.unwrap();
            assert_eq!((second.previous, second.current), (RoomStatus::Attaching, RoomStatus::Attached));
        }
    }

    #[tokio::test]
    async fn test_late_listener_misses_earlier_changes() {
        let monitor = StatusMonitor::new("lobby");
        monitor.set(RoomStatus::Attaching, None);
        let mut late = monitor.subscribe();
        monitor.set(RoomStatus::Attached, None);

        let change = late.recv().await.unwrap();
        assert_eq!(change.current, RoomStatus::Attached);
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_idle_listener_keeps_every_change() {
        let monitor = StatusMonitor::new("lobby");
        let mut idle = monitor.subscribe();

        let cycle = [
            RoomStatus::Attaching,
            RoomStatus::Attached,
            RoomStatus::Suspended,
            RoomStatus::Attached,
        ];
        for _ in 0..50 {
            for status in cycle {
                monitor.set(status, None);
            }
        }

        let mut previous = RoomStatus::Initialized;
        for i in 0..200 {
            let change = idle.try_recv().unwrap();
            assert_eq!(change.previous, previous);
            assert_eq!(change.current, cycle[i % cycle.len()]);
            previous = change.current;
        }
        assert!(idle.try_recv().is_err());
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let monitor = StatusMonitor::new("lobby");
        let kept = monitor.subscribe();
        drop(monitor.subscribe());
        monitor.set(RoomStatus::Attaching, None);
        assert_eq!(monitor.current.lock().listeners.len(), 1);
        drop(kept);
    }

    #[test]
    fn test_status_predicates() {
        assert!(RoomStatus::Released.is_terminal());
        assert!(!RoomStatus::Releasing.is_terminal());
        assert!(RoomStatus::Releasing.is_releasing_or_released());
        assert!(!RoomStatus::Failed.is_releasing_or_released());
        assert_eq!(RoomStatus::Suspended.to_string(), "Suspended");
    }
}
