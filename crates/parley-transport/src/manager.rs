//! Reference-counted channel sharing.
//!
//! Several room features can sit on the same transport channel, and rooms
//! can come and go while a channel stays in use. The manager keeps one
//! count per channel name and only hands the channel back to the provider
//! when the last user releases it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{Channel, ChannelProvider};

struct Entry {
    channel: Arc<dyn Channel>,
    refs: usize,
}

/// Shares channels from a [`ChannelProvider`] between users.
pub struct ChannelManager {
    provider: Arc<dyn ChannelProvider>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl ChannelManager {
    /// Creates a manager over `provider`.
    pub fn new(provider: Arc<dyn ChannelProvider>) -> Self {
        Self {
            provider,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Takes a reference to the channel named `name`.
    pub fn acquire(&self, name: &str) -> Arc<dyn Channel> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(name.to_owned()).or_insert_with(|| Entry {
            channel: self.provider.channel(name),
            refs: 0,
        });
        entry.refs += 1;
        tracing::trace!(channel = name, refs = entry.refs, "channel acquired");
        Arc::clone(&entry.channel)
    }

    /// Drops a reference to `name`. The channel is released back to the
    /// provider once no references remain.
    pub fn release(&self, name: &str) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(name) else {
            tracing::debug!(channel = name, "release of unknown channel ignored");
            return;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs > 0 {
            tracing::trace!(channel = name, refs = entry.refs, "channel reference dropped");
            return;
        }
        entries.remove(name);
        drop(entries);
        self.provider.release(name);
        tracing::debug!(channel = name, "channel released");
    }

    /// Number of live references to `name`.
    pub fn ref_count(&self, name: &str) -> usize {
        self.entries.lock().get(name).map_or(0, |e| e.refs)
    }

    /// The client id of the underlying connection.
    pub fn client_id(&self) -> String {
        self.provider.client_id()
    }
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use super::*;
    use crate::LocalTransport;

    #[test]
    fn test_shared_channel_released_after_last_reference() {
        let transport = Arc::new(LocalTransport::new("alice"));
        let manager = ChannelManager::new(transport.clone());

        let a = manager.acquire("room::$chat::$chatMessages");
        let b = manager.acquire("room::$chat::$chatMessages");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.ref_count("room::$chat::$chatMessages"), 2);

        manager.release("room::$chat::$chatMessages");
        assert!(transport.released().is_empty());

        manager.release("room::$chat::$chatMessages");
        assert_eq!(manager.ref_count("room::$chat::$chatMessages"), 0);
        assert_eq!(transport.released(), vec!["room::$chat::$chatMessages".to_string()]);
    }

    #[test]
    fn test_release_unknown_channel_is_noop() {
        let transport = Arc::new(LocalTransport::new("alice"));
        let manager = ChannelManager::new(transport.clone());
        manager.release("nope");
        assert!(transport.released().is_empty());
    }

    #[test]
    fn test_reacquire_after_release_gets_fresh_channel() {
        let transport = Arc::new(LocalTransport::new("alice"));
        let manager = ChannelManager::new(transport.clone());

        let first = manager.acquire("c");
        manager.release("c");
        let second = manager.acquire("c");
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
