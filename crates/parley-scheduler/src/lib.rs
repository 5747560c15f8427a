//! Single-flight operation scheduler for Parley.
//!
//! A room's lifecycle operations (attach, detach, release, retry) must
//! never overlap. [`AtomicScheduler`] runs at most one operation at a time
//! and queues the rest in two classes:
//!
//! - [`Priority::Internal`]: corrective work the lifecycle manager starts
//!   on its own (retries, wind-downs, releases requested by the registry).
//! - [`Priority::External`]: ordinary caller requests.
//!
//! Queued internal operations always start before queued external ones;
//! within a class, operations start in arrival order. A running operation
//! is never preempted.
//!
//! # Re-entrancy
//!
//! [`AtomicScheduler::enqueue`] is synchronous: it claims a place in the
//! queue immediately and returns an [`OperationHandle`]. An operation body
//! may enqueue further operations (for example a retry scheduling another
//! retry) and they are ordered like any other. Awaiting such a nested
//! handle from inside the running body deadlocks, since the nested
//! operation cannot start until the body finishes.
//!
//! ```ignore
//! let scheduler = AtomicScheduler::new("lobby");
//! let handle = scheduler.enqueue(Priority::External, "attach", async move {
//!     manager.do_attach().await
//! });
//! handle.await??;
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Which queue an operation waits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// Corrective work started by the lifecycle manager. Jumps ahead of
    /// every queued [`Priority::External`] operation.
    Internal,
    /// Work requested by a caller.
    External,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => f.write_str("internal"),
            Self::External => f.write_str("external"),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an operation handle resolved without the operation's output.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    /// The runtime shut down before the operation finished.
    #[error("operation {0} was cancelled")]
    Cancelled(String),

    /// The operation body panicked. The slot was still released.
    #[error("operation {0} panicked")]
    Panicked(String),
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Counters describing what the scheduler has done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerMetrics {
    /// Operations ever enqueued.
    pub enqueued: u64,
    /// Operations that have started running.
    pub started: u64,
    /// Operations whose body has finished (successfully, with an error,
    /// or by panicking).
    pub completed: u64,
    /// Internal-priority operations enqueued.
    pub internal: u64,
    /// External-priority operations enqueued.
    pub external: u64,
    /// The most operations ever observed running at once.
    pub max_in_flight: usize,
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

struct Waiter {
    id: u64,
    label: String,
    start: oneshot::Sender<()>,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    in_flight: usize,
    internal: VecDeque<Waiter>,
    external: VecDeque<Waiter>,
    metrics: SchedulerMetrics,
}

impl QueueState {
    fn mark_started(&mut self) {
        self.in_flight += 1;
        self.metrics.started += 1;
        self.metrics.max_in_flight = self.metrics.max_in_flight.max(self.in_flight);
    }

    fn pop_next(&mut self) -> Option<Waiter> {
        self.internal.pop_front().or_else(|| self.external.pop_front())
    }
}

struct Shared {
    name: String,
    state: Mutex<QueueState>,
}

impl Shared {
    /// Hands the slot to the next queued operation, or marks the scheduler
    /// idle if nothing is queued.
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.metrics.completed += 1;

        while let Some(waiter) = state.pop_next() {
            // A closed receiver means the waiting task was cancelled with
            // the runtime; skip it.
            if waiter.start.send(()).is_ok() {
                state.mark_started();
                trace!(
                    scheduler = %self.name,
                    op = %waiter.label,
                    id = waiter.id,
                    "operation granted slot"
                );
                return;
            }
        }
        trace!(scheduler = %self.name, "scheduler idle");
    }
}

/// Releases the slot when the running operation finishes, including when
/// its body panics.
struct Slot {
    shared: Arc<Shared>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.shared.release_slot();
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs async operations one at a time, internal-priority first.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct AtomicScheduler {
    shared: Arc<Shared>,
}

impl AtomicScheduler {
    /// Creates an idle scheduler. `name` appears in log output.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Queues `operation` and returns a handle resolving to its output.
    ///
    /// The operation's place in the queue is fixed when this returns. The
    /// body is spawned onto the Tokio runtime and does not start until it
    /// holds the slot. Must be called from within a Tokio runtime.
    pub fn enqueue<F, T>(
        &self,
        priority: Priority,
        label: impl Into<String>,
        operation: F,
    ) -> OperationHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let label = label.into();
        let (start_tx, start_rx) = oneshot::channel();

        {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.metrics.enqueued += 1;
            match priority {
                Priority::Internal => state.metrics.internal += 1,
                Priority::External => state.metrics.external += 1,
            }

            let waiter = Waiter {
                id,
                label: label.clone(),
                start: start_tx,
            };
            let idle =
                state.in_flight == 0 && state.internal.is_empty() && state.external.is_empty();
            if idle {
                state.mark_started();
                let _ = waiter.start.send(());
            } else {
                match priority {
                    Priority::Internal => state.internal.push_back(waiter),
                    Priority::External => state.external.push_back(waiter),
                }
            }
            debug!(
                scheduler = %self.shared.name,
                op = %label,
                id,
                %priority,
                queued = state.internal.len() + state.external.len(),
                "operation enqueued"
            );
        }

        let shared = Arc::clone(&self.shared);
        let join = tokio::spawn(async move {
            // The sender lives in the queue until it is granted, and the
            // queue lives as long as `shared`, which this task holds.
            let _ = start_rx.await;
            let _slot = Slot { shared };
            operation.await
        });

        OperationHandle { label, join }
    }

    /// Number of operations waiting for the slot.
    pub fn queued(&self) -> usize {
        let state = self.shared.state.lock();
        state.internal.len() + state.external.len()
    }

    /// Returns `true` if nothing is running or queued.
    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.in_flight == 0 && state.internal.is_empty() && state.external.is_empty()
    }

    /// Snapshot of the scheduler's counters.
    pub fn metrics(&self) -> SchedulerMetrics {
        self.shared.state.lock().metrics.clone()
    }
}

impl fmt::Debug for AtomicScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicScheduler")
            .field("name", &self.shared.name)
            .field("queued", &self.queued())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Resolves to an operation's output once its body has run.
///
/// Dropping the handle does not cancel the operation.
pub struct OperationHandle<T> {
    label: String,
    join: JoinHandle<T>,
}

impl<T> OperationHandle<T> {
    /// The label the operation was enqueued with.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns `true` once the operation body has finished.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl<T> Future for OperationHandle<T> {
    type Output = Result<T, SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.join).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(output)) => Poll::Ready(Ok(output)),
            Poll::Ready(Err(e)) if e.is_panic() => {
                Poll::Ready(Err(SchedulerError::Panicked(self.label.clone())))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::Cancelled(self.label.clone()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_display() {
        assert_eq!(Priority::Internal.to_string(), "internal");
        assert_eq!(Priority::External.to_string(), "external");
    }

    #[tokio::test]
    async fn test_new_scheduler_is_idle() {
        let scheduler = AtomicScheduler::new("room");
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.queued(), 0);
        assert_eq!(scheduler.metrics(), SchedulerMetrics::default());
    }

    #[tokio::test]
    async fn test_single_operation_runs_and_returns_output() {
        let scheduler = AtomicScheduler::new("room");
        let handle = scheduler.enqueue(Priority::External, "attach", async { 7 });
        assert_eq!(handle.label(), "attach");
        assert_eq!(handle.await.unwrap(), 7);

        let metrics = scheduler.metrics();
        assert_eq!(metrics.enqueued, 1);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.external, 1);
        assert!(scheduler.is_idle());
    }
}
