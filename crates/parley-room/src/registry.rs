//! The room registry.
//!
//! [`Rooms`] hands out one [`Room`] per name and arbitrates between `get`
//! and `release` of the same name:
//!
//! - while a release is in flight, `get` waits for it and then looks the
//!   name up again, so it always sees a freshly built room and never the
//!   one being released;
//! - a second `release` of the same name waits for the first;
//! - the released room leaves the registry before any waiting `get` runs;
//! - a release runs in its own task, so a caller that stops awaiting it
//!   does not cut it short.
//!
//! Waiting uses single-resolution deferreds: a oneshot whose receiver is
//! made [`Shared`] so any number of callers can await it.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::Shared;
use parking_lot::Mutex;
use parley_scheduler::SchedulerError;
use parley_transport::ChannelManager;
use tokio::sync::oneshot;

use crate::{ChatApi, ClientOptions, Room, RoomError, RoomOptions};

type Signal = Shared<oneshot::Receiver<()>>;

// ---------------------------------------------------------------------------
// Deferred
// ---------------------------------------------------------------------------

struct Deferred {
    resolve: oneshot::Sender<()>,
    wait: Signal,
}

impl Deferred {
    fn new() -> Self {
        let (resolve, wait) = oneshot::channel();
        Self {
            resolve,
            wait: wait.shared(),
        }
    }

    fn resolve(self) {
        let _ = self.resolve.send(());
    }
}

#[derive(Default)]
struct RegistryState {
    rooms: HashMap<String, Arc<Room>>,
    /// Releases in flight, by room name.
    releases: HashMap<String, Signal>,
    /// One deferred per name shared by every `get` blocked on a release.
    gets: HashMap<String, Deferred>,
}

/// Finishes a release: unregisters the room and wakes everyone waiting on
/// it. Owned by the release task, so it only runs once the room's release
/// has completed, or if that task panics or the runtime shuts it down.
struct ReleaseGuard {
    state: Arc<Mutex<RegistryState>>,
    name: String,
    room: Arc<Room>,
    deferred: Option<Deferred>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let gets = {
            let mut state = self.state.lock();
            if state
                .rooms
                .get(&self.name)
                .is_some_and(|room| Arc::ptr_eq(room, &self.room))
            {
                state.rooms.remove(&self.name);
            }
            state.releases.remove(&self.name);
            state.gets.remove(&self.name)
        };
        if let Some(deferred) = self.deferred.take() {
            deferred.resolve();
        }
        if let Some(gets) = gets {
            gets.resolve();
        }
        tracing::info!(room = %self.name, "room released");
    }
}

enum ReleaseStep {
    Nothing,
    Wait(Signal),
    Release(Arc<Room>, ReleaseGuard),
}

// ---------------------------------------------------------------------------
// Rooms
// ---------------------------------------------------------------------------

/// Every room a client has open, by name.
pub struct Rooms {
    channels: Arc<ChannelManager>,
    api: Arc<dyn ChatApi>,
    options: ClientOptions,
    state: Arc<Mutex<RegistryState>>,
}

impl Rooms {
    pub fn new(channels: Arc<ChannelManager>, api: Arc<dyn ChatApi>, options: ClientOptions) -> Self {
        Self {
            channels,
            api,
            options,
            state: Arc::new(Mutex::new(RegistryState::default())),
        }
    }

    /// Returns the room called `name`, creating it if needed.
    ///
    /// Passing `None` accepts an existing room whatever its options, and
    /// creates a new one with [`RoomOptions::default`]. Passing options
    /// that differ from an existing room's fails with
    /// [`RoomError::OptionsMismatch`] and leaves that room alone.
    pub async fn get(
        &self,
        name: &str,
        options: impl Into<Option<RoomOptions>>,
    ) -> Result<Arc<Room>, RoomError> {
        let requested = options.into();
        loop {
            let wait = {
                let mut state = self.state.lock();
                if !state.releases.contains_key(name) {
                    return self.get_or_create(&mut state, name, requested);
                }
                state
                    .gets
                    .entry(name.to_owned())
                    .or_insert_with(Deferred::new)
                    .wait
                    .clone()
            };
            tracing::debug!(room = name, "get waiting for release");
            let _ = wait.await;
        }
    }

    fn get_or_create(
        &self,
        state: &mut RegistryState,
        name: &str,
        requested: Option<RoomOptions>,
    ) -> Result<Arc<Room>, RoomError> {
        if let Some(room) = state.rooms.get(name) {
            if requested.as_ref().is_some_and(|o| o != room.options()) {
                return Err(RoomError::OptionsMismatch(name.to_owned()));
            }
            return Ok(Arc::clone(room));
        }

        let room = Arc::new(Room::new(
            name,
            requested.unwrap_or_default(),
            &self.channels,
            &self.api,
            &self.options,
        )?);
        state.rooms.insert(name.to_owned(), Arc::clone(&room));
        tracing::info!(room = name, rooms = state.rooms.len(), "room created");
        Ok(room)
    }

    /// Releases the room called `name` and removes it from the registry.
    ///
    /// A no-op if there is no such room. If the room is already being
    /// released, waits for that release instead.
    ///
    /// The release itself runs in a spawned task. Dropping this future
    /// stops the wait, not the release: the name stays reserved until the
    /// room is `Released`.
    pub async fn release(&self, name: &str) -> Result<(), RoomError> {
        let step = {
            let mut state = self.state.lock();
            if let Some(wait) = state.releases.get(name) {
                ReleaseStep::Wait(wait.clone())
            } else if let Some(room) = state.rooms.get(name).cloned() {
                let deferred = Deferred::new();
                state.releases.insert(name.to_owned(), deferred.wait.clone());
                let guard = ReleaseGuard {
                    state: Arc::clone(&self.state),
                    name: name.to_owned(),
                    room: Arc::clone(&room),
                    deferred: Some(deferred),
                };
                ReleaseStep::Release(room, guard)
            } else {
                ReleaseStep::Nothing
            }
        };

        match step {
            ReleaseStep::Nothing => Ok(()),
            ReleaseStep::Wait(wait) => {
                let _ = wait.await;
                Ok(())
            }
            ReleaseStep::Release(room, guard) => {
                tracing::debug!(room = name, "releasing room");
                let task = tokio::spawn(async move {
                    let result = room.release().await;
                    drop(guard);
                    result
                });
                match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => {
                        Err(SchedulerError::Panicked(format!("release {name}")).into())
                    }
                    Err(_) => Err(SchedulerError::Cancelled(format!("release {name}")).into()),
                }
            }
        }
    }

    /// Number of rooms in the registry, including any being released.
    pub fn count(&self) -> usize {
        self.state.lock().rooms.len()
    }

    /// The options rooms are created with.
    pub fn client_options(&self) -> &ClientOptions {
        &self.options
    }
}

impl std::fmt::Debug for Rooms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rooms").field("count", &self.count()).finish()
    }
}
