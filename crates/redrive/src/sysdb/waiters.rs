//! In-process registry of notification waiters
//!
//! `recv` and `get_event` subscribe before their initial read; the listener
//! task (or the in-memory store's writers) wake them by key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub(crate) struct WaiterMap {
    inner: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl WaiterMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a key, creating the shared Notify if needed
    pub fn subscribe(&self, key: &str) -> Arc<Notify> {
        let mut map = self.inner.lock();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Wake every waiter currently registered for a key
    pub fn wake(&self, key: &str) {
        let notify = self.inner.lock().get(key).cloned();
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
    }

    /// Drop a subscription, removing the entry once the last waiter leaves
    pub fn release(&self, key: &str, handle: Arc<Notify>) {
        let mut map = self.inner.lock();
        drop(handle);
        if let Some(entry) = map.get(key) {
            // One reference in the map, none outside it
            if Arc::strong_count(entry) == 1 {
                map.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribe_wake() {
        let waiters = WaiterMap::new();
        let notify = waiters.subscribe("n::wf::topic");

        let notified = notify.notified();
        tokio::pin!(notified);

        waiters.wake("n::wf::topic");
        tokio::time::timeout(Duration::from_millis(100), &mut notified)
            .await
            .expect("waiter should be woken");
    }

    #[tokio::test]
    async fn test_release_cleans_up() {
        let waiters = WaiterMap::new();
        let notify = waiters.subscribe("key");
        waiters.release("key", notify);

        assert!(waiters.inner.lock().is_empty());
    }

    #[tokio::test]
    async fn test_wake_unknown_key_is_noop() {
        let waiters = WaiterMap::new();
        waiters.wake("nobody-home");
    }
}
