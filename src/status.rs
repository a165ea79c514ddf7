//! Sync status notifications.
//!
//! Observers either hold a broadcast receiver (dropping it unsubscribes) or
//! register a callback and later unsubscribe by id. Status is informational
//! only and never gates a drain.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::models::SyncPhase;

const STATUS_CHANNEL_CAPACITY: usize = 32;

type StatusCallback = Box<dyn Fn(SyncPhase) + Send + Sync>;

/// Handle returned by [`StatusBroadcaster::on_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub struct StatusBroadcaster {
    tx: broadcast::Sender<SyncPhase>,
    callbacks: Mutex<BTreeMap<SubscriptionId, StatusCallback>>,
    next_id: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            tx,
            callbacks: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Receive phases as a stream
    pub fn subscribe(&self) -> broadcast::Receiver<SyncPhase> {
        self.tx.subscribe()
    }

    /// Register a callback invoked synchronously on every phase change
    pub fn on_status<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(SyncPhase) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        match self.callbacks.lock() {
            Ok(mut callbacks) => {
                callbacks.insert(id, Box::new(callback));
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(id, Box::new(callback));
            }
        }
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.callbacks.lock() {
            Ok(mut callbacks) => callbacks.remove(&id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
        }
    }

    /// Deliver a phase to every observer
    pub fn emit(&self, phase: SyncPhase) {
        tracing::debug!(phase = phase.as_str(), "Sync status");
        let _ = self.tx.send(phase);

        let callbacks = match self.callbacks.lock() {
            Ok(callbacks) => callbacks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for callback in callbacks.values() {
            callback(phase);
        }
    }
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_receivers_get_phases_in_order() {
        let status = StatusBroadcaster::new();
        let mut rx = status.subscribe();

        status.emit(SyncPhase::Start);
        status.emit(SyncPhase::End);

        assert_eq!(rx.try_recv().unwrap(), SyncPhase::Start);
        assert_eq!(rx.try_recv().unwrap(), SyncPhase::End);
    }

    #[test]
    fn test_emit_without_observers() {
        StatusBroadcaster::new().emit(SyncPhase::Start);
    }

    #[test]
    fn test_callbacks_and_unsubscribe() {
        let status = StatusBroadcaster::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = status.on_status(move |phase| sink.lock().unwrap().push(phase));

        status.emit(SyncPhase::Start);
        assert!(status.unsubscribe(id));
        status.emit(SyncPhase::End);

        assert_eq!(*seen.lock().unwrap(), vec![SyncPhase::Start]);
        assert!(!status.unsubscribe(id));
    }

    #[test]
    fn test_multiple_callbacks() {
        let status = StatusBroadcaster::new();
        let count = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let count = count.clone();
            status.on_status(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        status.emit(SyncPhase::Start);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
