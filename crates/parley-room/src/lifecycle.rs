//! The room lifecycle manager.
//!
//! The manager drives a room's contributors through attach, detach, and
//! release, and reacts to what their channels do in between. Every
//! operation that changes the room's status runs on the room's
//! [`AtomicScheduler`], so at most one is in flight at a time:
//!
//! | operation   | priority | started by |
//! |-------------|----------|------------|
//! | attach      | External | caller |
//! | detach      | External | caller |
//! | release     | Internal | registry / caller |
//! | retry       | Internal | a channel suspending while the room is attached |
//! | wind-down   | Internal | a channel failing while the room is attached |
//!
//! # Channel monitoring
//!
//! One monitor task per contributor watches its channel's state changes.
//! Changes observed while an operation is running are left to that
//! operation, with one exception: non-resumed reattachments are recorded
//! as pending discontinuities and delivered when the room next reaches
//! `Attached`.
//!
//! # Retry
//!
//! A retry winds down every contributor except those whose channel
//! suspended (the *origins*), waits for the origin channels to come back
//! on their own, then attaches the rest. If a channel fails instead, the
//! room fails. If a contributor suspends again during the retry, another
//! retry is scheduled after `retry_timeout` plus jitter.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use parley_protocol::{ErrorCode, ErrorInfo, Serial};
use parley_scheduler::{AtomicScheduler, Priority};
use parley_transport::{ChannelState, ChannelStateChange, TransportError};
use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

use crate::status::StatusMonitor;
use crate::{ClientOptions, Contributor, Feature, RoomError, RoomStatus, StatusSubscription};

type SharedContributor = Arc<dyn Contributor>;

// ---------------------------------------------------------------------------
// Manager state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ManagerState {
    operation_in_progress: bool,
    has_attached_once: bool,
    explicitly_detached: bool,
    /// Discontinuities to deliver once the room is next `Attached`.
    pending_discontinuities: BTreeMap<Feature, ErrorInfo>,
    /// Last attach serial accounted for per feature, so one reattachment
    /// is never reported twice.
    handled_serials: HashMap<Feature, Serial>,
    /// Features whose channels suspended, waiting for a queued retry.
    pending_retry: Option<BTreeSet<Feature>>,
}

impl ManagerState {
    /// Returns `false` if the attachment at `serial` was already seen.
    fn mark_handled(&mut self, feature: Feature, serial: Option<&Serial>) -> bool {
        let Some(serial) = serial else {
            return true;
        };
        if self.handled_serials.get(&feature) == Some(serial) {
            return false;
        }
        self.handled_serials.insert(feature, serial.clone());
        true
    }

    fn discontinuity_possible(&self) -> bool {
        self.has_attached_once && !self.explicitly_detached
    }
}

/// Clears `operation_in_progress` when an operation ends, even by panic.
struct OperationScope<'a> {
    state: &'a Mutex<ManagerState>,
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        self.state.lock().operation_in_progress = false;
    }
}

enum Drift {
    Settled,
    Suspended(BTreeSet<Feature>, ErrorInfo),
    Failed(ErrorInfo),
}

fn with_cause(info: ErrorInfo, cause: Option<&ErrorInfo>) -> ErrorInfo {
    match cause {
        Some(cause) => info.with_cause(cause.clone()),
        None => info,
    }
}

fn discontinuity_error(feature: Feature, cause: Option<&ErrorInfo>) -> ErrorInfo {
    with_cause(
        ErrorCode::RoomDiscontinuity.info(format!("discontinuity detected on {feature} channel")),
        cause,
    )
}

// ---------------------------------------------------------------------------
// LifecycleManager
// ---------------------------------------------------------------------------

/// Drives a room's contributors through the room status state machine.
pub struct LifecycleManager {
    room: String,
    contributors: Vec<SharedContributor>,
    status: StatusMonitor,
    scheduler: AtomicScheduler,
    state: Mutex<ManagerState>,
    retry_timeout: Duration,
    retry_jitter: Duration,
    monitors: Mutex<Vec<JoinHandle<()>>>,
    retry_timer: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleManager {
    /// Creates a manager for `room` and starts watching the contributors'
    /// channels. Contributors are put in precedence order.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(room: &str, mut contributors: Vec<SharedContributor>, options: &ClientOptions) -> Arc<Self> {
        contributors.sort_by_key(|c| c.feature());
        let manager = Arc::new(Self {
            room: room.to_owned(),
            contributors,
            status: StatusMonitor::new(room),
            scheduler: AtomicScheduler::new(room),
            state: Mutex::new(ManagerState::default()),
            retry_timeout: options.retry_timeout,
            retry_jitter: options.retry_jitter,
            monitors: Mutex::new(Vec::new()),
            retry_timer: Mutex::new(None),
        });
        manager.start_monitors();
        manager
    }

    fn start_monitors(self: &Arc<Self>) {
        let mut monitors = self.monitors.lock();
        for contributor in &self.contributors {
            let changes = contributor.channel().on_state_change();
            monitors.push(tokio::spawn(monitor(
                Arc::downgrade(self),
                Arc::clone(contributor),
                changes,
            )));
        }
    }

    /// The current room status.
    pub fn status(&self) -> RoomStatus {
        self.status.status()
    }

    /// The error attached to the current status, if any.
    pub fn error(&self) -> Option<ErrorInfo> {
        self.status.error()
    }

    /// Subscribes to status changes.
    pub fn on_status_change(&self) -> StatusSubscription {
        self.status.subscribe()
    }

    /// The scheduler lifecycle operations run on.
    pub fn scheduler(&self) -> &AtomicScheduler {
        &self.scheduler
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Attaches every contributor, in precedence order.
    ///
    /// If one fails, those already attached are detached again and the
    /// room becomes `Failed` with the failing feature's attachment code.
    pub async fn attach(self: &Arc<Self>) -> Result<(), RoomError> {
        let this = Arc::clone(self);
        self.scheduler
            .enqueue(Priority::External, "attach", async move { this.do_attach().await })
            .await?
    }

    /// Detaches every contributor, in reverse precedence order.
    pub async fn detach(self: &Arc<Self>) -> Result<(), RoomError> {
        let this = Arc::clone(self);
        self.scheduler
            .enqueue(Priority::External, "detach", async move { this.do_detach().await })
            .await?
    }

    /// Releases every contributor. Never fails once started; releasing a
    /// released room is a no-op.
    pub async fn release(self: &Arc<Self>) -> Result<(), RoomError> {
        let this = Arc::clone(self);
        self.scheduler
            .enqueue(Priority::Internal, "release", async move { this.do_release().await })
            .await?;
        Ok(())
    }

    fn begin_operation(&self) -> OperationScope<'_> {
        self.state.lock().operation_in_progress = true;
        OperationScope { state: &self.state }
    }

    fn refuse(&self, code: ErrorCode, action: &str) -> RoomError {
        RoomError::Lifecycle(code.info(format!("unable to {action} room {}", self.room)))
    }

    async fn do_attach(self: &Arc<Self>) -> Result<(), RoomError> {
        let scope = self.begin_operation();
        match self.status.status() {
            RoomStatus::Attached => return Ok(()),
            RoomStatus::Releasing => return Err(self.refuse(ErrorCode::RoomIsReleasing, "attach")),
            RoomStatus::Released => return Err(self.refuse(ErrorCode::RoomIsReleased, "attach")),
            RoomStatus::Failed => return Err(self.refuse(ErrorCode::RoomInFailedState, "attach")),
            _ => {}
        }

        self.status.set(RoomStatus::Attaching, None);
        for (index, contributor) in self.contributors.iter().enumerate() {
            if let Err(e) = self.attach_contributor(contributor).await {
                let feature = contributor.feature();
                let error = with_cause(
                    contributor
                        .attachment_error_code()
                        .info(format!("failed to attach {feature} feature")),
                    e.reason(),
                );
                tracing::error!(room = %self.room, %feature, error = %e, "room attach failed");

                for previous in self.contributors[..index].iter().rev() {
                    if let Err(e) = previous.detach().await {
                        tracing::warn!(
                            room = %self.room,
                            feature = %previous.feature(),
                            error = %e,
                            "failed to detach feature after attach failure"
                        );
                    }
                }
                self.status.set(RoomStatus::Failed, Some(error.clone()));
                return Err(RoomError::Lifecycle(error));
            }
        }

        {
            let mut state = self.state.lock();
            state.has_attached_once = true;
            state.explicitly_detached = false;
            state.pending_retry = None;
        }
        match self.channel_drift() {
            Drift::Settled => {}
            Drift::Suspended(features, error) => {
                tracing::warn!(room = %self.room, ?features, "feature suspended during attach, scheduling retry");
                self.state.lock().pending_retry = Some(features);
                self.status.set(RoomStatus::Suspended, Some(error));
                drop(scope);
                self.enqueue_retry();
                return Ok(());
            }
            Drift::Failed(error) => {
                tracing::error!(room = %self.room, error = %error, "feature failed during attach");
                self.status.set(RoomStatus::Failed, Some(error.clone()));
                self.wind_down().await;
                return Err(RoomError::Lifecycle(error));
            }
        }
        self.status.set(RoomStatus::Attached, None);
        // Anything queued while the operation ran is flushed below; later
        // discontinuities are delivered directly.
        drop(scope);
        self.flush_discontinuities();
        Ok(())
    }

    async fn do_detach(&self) -> Result<(), RoomError> {
        let _scope = self.begin_operation();
        match self.status.status() {
            RoomStatus::Initialized | RoomStatus::Detached => return Ok(()),
            RoomStatus::Releasing => return Err(self.refuse(ErrorCode::RoomIsReleasing, "detach")),
            RoomStatus::Released => return Err(self.refuse(ErrorCode::RoomIsReleased, "detach")),
            RoomStatus::Failed => return Err(self.refuse(ErrorCode::RoomInFailedState, "detach")),
            _ => {}
        }

        self.status.set(RoomStatus::Detaching, None);
        {
            let mut state = self.state.lock();
            state.explicitly_detached = true;
            state.pending_retry = None;
            state.pending_discontinuities.clear();
        }

        let mut first_error = None;
        for contributor in self.contributors.iter().rev() {
            if let Err(e) = contributor.detach().await {
                let feature = contributor.feature();
                tracing::warn!(room = %self.room, %feature, error = %e, "failed to detach feature");
                if first_error.is_none() {
                    first_error = Some(with_cause(
                        contributor
                            .detachment_error_code()
                            .info(format!("failed to detach {feature} feature")),
                        e.reason(),
                    ));
                }
            }
        }

        match first_error {
            None => {
                self.status.set(RoomStatus::Detached, None);
                Ok(())
            }
            Some(error) => {
                self.status.set(RoomStatus::Failed, Some(error.clone()));
                Err(RoomError::Lifecycle(error))
            }
        }
    }

    async fn do_release(&self) {
        let _scope = self.begin_operation();
        if self.status.status() == RoomStatus::Released {
            return;
        }

        self.status.set(RoomStatus::Releasing, None);
        {
            let mut state = self.state.lock();
            state.pending_retry = None;
            state.pending_discontinuities.clear();
        }
        self.stop_background_tasks();

        for contributor in self.contributors.iter().rev() {
            contributor.release().await;
        }
        self.status.set(RoomStatus::Released, None);
    }

    async fn do_retry(self: &Arc<Self>) {
        let scope = self.begin_operation();
        let Some(origins) = self.state.lock().pending_retry.take() else {
            return;
        };
        if self.status.status() != RoomStatus::Suspended {
            tracing::debug!(room = %self.room, status = %self.status.status(), "retry no longer needed");
            return;
        }

        // Contributors sharing a channel with an origin are origins too:
        // detaching them would detach the channel being waited on.
        let origin_channels: HashSet<&str> = self
            .contributors
            .iter()
            .filter(|c| origins.contains(&c.feature()))
            .map(|c| c.channel().name())
            .collect();
        let (waiting, others): (Vec<&SharedContributor>, Vec<&SharedContributor>) = self
            .contributors
            .iter()
            .partition(|c| origin_channels.contains(c.channel().name()));
        tracing::info!(room = %self.room, origins = ?origins, "retrying room attachment");

        for contributor in others.iter().rev() {
            if let Err(e) = contributor.detach().await {
                tracing::warn!(
                    room = %self.room,
                    feature = %contributor.feature(),
                    error = %e,
                    "failed to wind down feature during retry"
                );
            }
        }

        let mut waited = HashSet::new();
        for contributor in &waiting {
            if !waited.insert(contributor.channel().name()) {
                continue;
            }
            if let Err(reason) = self.wait_for_recovery(contributor).await {
                let feature = contributor.feature();
                let error = with_cause(
                    contributor
                        .attachment_error_code()
                        .info(format!("{feature} channel failed during retry")),
                    reason.as_ref(),
                );
                tracing::error!(room = %self.room, %feature, "room failed during retry");
                self.status.set(RoomStatus::Failed, Some(error));
                self.wind_down().await;
                return;
            }
        }

        for contributor in &others {
            if let Err(e) = self.attach_contributor(contributor).await {
                let feature = contributor.feature();
                let error = with_cause(
                    contributor
                        .attachment_error_code()
                        .info(format!("failed to attach {feature} feature during retry")),
                    e.reason(),
                );
                if contributor.channel().state() == ChannelState::Suspended {
                    tracing::warn!(room = %self.room, %feature, error = %e, "retry suspended, rescheduling");
                    self.status.set(RoomStatus::Suspended, Some(error));
                    self.schedule_delayed_retry(BTreeSet::from([feature]));
                } else {
                    tracing::error!(room = %self.room, %feature, error = %e, "retry failed");
                    self.status.set(RoomStatus::Failed, Some(error));
                    self.wind_down().await;
                }
                return;
            }
        }

        match self.channel_drift() {
            Drift::Settled => {}
            Drift::Suspended(features, error) => {
                tracing::warn!(room = %self.room, ?features, "feature suspended during retry, rescheduling");
                self.status.set(RoomStatus::Suspended, Some(error));
                self.schedule_delayed_retry(features);
                return;
            }
            Drift::Failed(error) => {
                tracing::error!(room = %self.room, error = %error, "feature failed during retry");
                self.status.set(RoomStatus::Failed, Some(error));
                self.wind_down().await;
                return;
            }
        }

        self.status.set(RoomStatus::Attached, None);
        drop(scope);
        self.flush_discontinuities();
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Attaches one contributor and accounts for the attachment it caused.
    async fn attach_contributor(&self, contributor: &SharedContributor) -> Result<(), TransportError> {
        let mut changes = contributor.channel().on_state_change();
        contributor.attach().await?;

        let mut latest = None;
        loop {
            match changes.try_recv() {
                Ok(change) if change.current == ChannelState::Attached => latest = Some(change),
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        if let Some(change) = latest {
            self.record_attachment(contributor.channel().name(), &change);
        }
        Ok(())
    }

    /// Records an attachment seen by an operation for every contributor on
    /// `channel`, queueing discontinuities if it did not resume.
    fn record_attachment(&self, channel: &str, change: &ChannelStateChange) {
        let mut state = self.state.lock();
        for contributor in self.contributors.iter().filter(|c| c.channel().name() == channel) {
            let feature = contributor.feature();
            if !state.mark_handled(feature, change.attach_serial.as_ref()) {
                continue;
            }
            if change.resumed || !state.discontinuity_possible() {
                continue;
            }
            state
                .pending_discontinuities
                .entry(feature)
                .or_insert_with(|| discontinuity_error(feature, change.reason.as_ref()));
        }
    }

    /// Channel states the monitors ignored while this operation held the
    /// room. Checked before the room is declared `Attached`.
    fn channel_drift(&self) -> Drift {
        let mut suspended = BTreeSet::new();
        let mut error = None;
        for contributor in &self.contributors {
            let feature = contributor.feature();
            let channel = contributor.channel();
            match channel.state() {
                ChannelState::Failed => {
                    return Drift::Failed(with_cause(
                        contributor
                            .attachment_error_code()
                            .info(format!("{feature} channel failed")),
                        channel.error_reason().as_ref(),
                    ));
                }
                ChannelState::Suspended => {
                    suspended.insert(feature);
                    if error.is_none() {
                        error = Some(with_cause(
                            contributor
                                .attachment_error_code()
                                .info(format!("{feature} channel suspended")),
                            channel.error_reason().as_ref(),
                        ));
                    }
                }
                _ => {}
            }
        }
        match error {
            Some(error) => Drift::Suspended(suspended, error),
            None => Drift::Settled,
        }
    }

    /// Waits for a suspended contributor's channel to attach again.
    /// Returns the failure reason if it fails instead.
    async fn wait_for_recovery(&self, contributor: &SharedContributor) -> Result<(), Option<ErrorInfo>> {
        let channel = contributor.channel();
        let mut changes = channel.on_state_change();
        loop {
            match channel.state() {
                ChannelState::Attached => return Ok(()),
                ChannelState::Failed => return Err(channel.error_reason()),
                _ => {}
            }
            match changes.recv().await {
                Ok(change) => match change.current {
                    ChannelState::Attached => {
                        self.record_attachment(channel.name(), &change);
                        return Ok(());
                    }
                    ChannelState::Failed => return Err(change.reason),
                    _ => {}
                },
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Err(None),
            }
        }
    }

    /// Detaches every contributor whose channel has not failed.
    async fn wind_down(&self) {
        for contributor in self.contributors.iter().rev() {
            if contributor.channel().state() == ChannelState::Failed {
                continue;
            }
            if let Err(e) = contributor.detach().await {
                tracing::warn!(
                    room = %self.room,
                    feature = %contributor.feature(),
                    error = %e,
                    "failed to wind down feature"
                );
            }
        }
    }

    fn flush_discontinuities(&self) {
        let pending = std::mem::take(&mut self.state.lock().pending_discontinuities);
        for (feature, reason) in pending {
            if let Some(contributor) = self.contributors.iter().find(|c| c.feature() == feature) {
                contributor.discontinuity_detected(reason);
            }
        }
    }

    fn enqueue_retry(self: &Arc<Self>) {
        let this = Arc::clone(self);
        // Retry failures surface through the status stream only.
        drop(
            self.scheduler
                .enqueue(Priority::Internal, "retry", async move { this.do_retry().await }),
        );
    }

    fn enqueue_wind_down(self: &Arc<Self>) {
        let this = Arc::clone(self);
        drop(self.scheduler.enqueue(Priority::Internal, "wind-down", async move {
            let _scope = this.begin_operation();
            if this.status.status() == RoomStatus::Failed {
                this.wind_down().await;
            }
        }));
    }

    fn schedule_delayed_retry(self: &Arc<Self>, origins: BTreeSet<Feature>) {
        self.state
            .lock()
            .pending_retry
            .get_or_insert_with(BTreeSet::new)
            .extend(origins);

        let jitter_ms = u64::try_from(self.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        let delay = self.retry_timeout + Duration::from_millis(rand::rng().random_range(0..=jitter_ms));
        tracing::debug!(room = %self.room, ?delay, "retry scheduled");

        let manager = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = manager.upgrade() {
                manager.enqueue_retry();
            }
        });
        if let Some(previous) = self.retry_timer.lock().replace(timer) {
            previous.abort();
        }
    }

    fn stop_background_tasks(&self) {
        for monitor in self.monitors.lock().drain(..) {
            monitor.abort();
        }
        if let Some(timer) = self.retry_timer.lock().take() {
            timer.abort();
        }
    }

    // -----------------------------------------------------------------------
    // Channel events outside operations
    // -----------------------------------------------------------------------

    fn on_channel_change(self: &Arc<Self>, contributor: &SharedContributor, change: ChannelStateChange) {
        match change.current {
            ChannelState::Attached => self.on_attached(contributor, &change),
            ChannelState::Suspended => self.on_suspended(contributor, change.reason.as_ref()),
            ChannelState::Failed => self.on_failed(contributor, change.reason.as_ref()),
            _ => {}
        }
    }

    fn on_attached(&self, contributor: &SharedContributor, change: &ChannelStateChange) {
        let feature = contributor.feature();
        let mut state = self.state.lock();
        if !state.mark_handled(feature, change.attach_serial.as_ref()) {
            return;
        }
        if change.resumed || !state.discontinuity_possible() {
            return;
        }

        let reason = discontinuity_error(feature, change.reason.as_ref());
        if state.operation_in_progress || self.status.status() != RoomStatus::Attached {
            tracing::debug!(room = %self.room, %feature, "discontinuity queued");
            state.pending_discontinuities.entry(feature).or_insert(reason);
        } else {
            drop(state);
            contributor.discontinuity_detected(reason);
        }
    }

    fn on_suspended(self: &Arc<Self>, contributor: &SharedContributor, reason: Option<&ErrorInfo>) {
        let feature = contributor.feature();
        let mut state = self.state.lock();
        if state.operation_in_progress {
            return;
        }
        match self.status.status() {
            RoomStatus::Attached => {
                state.pending_retry = Some(BTreeSet::from([feature]));
                drop(state);
                let error = with_cause(
                    contributor
                        .attachment_error_code()
                        .info(format!("{feature} channel suspended")),
                    reason,
                );
                tracing::warn!(room = %self.room, %feature, "feature suspended, scheduling retry");
                self.status.set(RoomStatus::Suspended, Some(error));
                self.enqueue_retry();
            }
            RoomStatus::Suspended => {
                if let Some(pending) = state.pending_retry.as_mut() {
                    pending.insert(feature);
                }
            }
            _ => {}
        }
    }

    fn on_failed(self: &Arc<Self>, contributor: &SharedContributor, reason: Option<&ErrorInfo>) {
        let feature = contributor.feature();
        {
            let mut state = self.state.lock();
            if state.operation_in_progress {
                return;
            }
            if !matches!(self.status.status(), RoomStatus::Attached | RoomStatus::Suspended) {
                return;
            }
            state.pending_retry = None;
        }

        let error = with_cause(
            contributor
                .attachment_error_code()
                .info(format!("{feature} channel failed")),
            reason,
        );
        tracing::error!(room = %self.room, %feature, "feature failed, room failed");
        self.status.set(RoomStatus::Failed, Some(error));
        self.enqueue_wind_down();
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        self.stop_background_tasks();
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("room", &self.room)
            .field("status", &self.status.status())
            .finish()
    }
}

async fn monitor(
    manager: Weak<LifecycleManager>,
    contributor: SharedContributor,
    mut changes: broadcast::Receiver<ChannelStateChange>,
) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(feature = %contributor.feature(), skipped, "channel monitor lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.on_channel_change(&contributor, change);
    }
}
