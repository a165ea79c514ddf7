//! Connectivity Oracle: platform-reported online/offline state.
//!
//! The platform layer calls [`ConnectivityOracle::set_online`] whenever its
//! reachability signal changes. Observers get a [`BecameReachable`] event
//! exactly once per offline to online transition; repeated reports of the
//! same state are ignored.
//!
//! Being online here is not proof that the remote store answers. The sync
//! engine treats a failed remote call as "still offline" for that item.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};

/// Capacity of the reachability event channel
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Fired when the client goes from offline to online
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BecameReachable {
    pub at: DateTime<Utc>,
}

pub struct ConnectivityOracle {
    state: watch::Sender<bool>,
    events: broadcast::Sender<BecameReachable>,
}

impl ConnectivityOracle {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { state, events }
    }

    /// Best-effort current state
    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Report the platform's reachability. Returns true if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            if online {
                tracing::info!("Connectivity restored");
                // No subscribers is fine; the state is still recorded
                let _ = self.events.send(BecameReachable { at: Utc::now() });
            } else {
                tracing::warn!("Connectivity lost, writes will be queued");
            }
        }
        changed
    }

    /// Subscribe to offline to online transitions
    pub fn subscribe(&self) -> broadcast::Receiver<BecameReachable> {
        self.events.subscribe()
    }

    /// Watch the raw online state
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Wait until the client has stayed online for `debounce`.
    ///
    /// Returns false right away if currently offline, or as soon as the
    /// state drops to offline within the window.
    pub async fn settle(&self, debounce: Duration) -> bool {
        let mut rx = self.state.subscribe();
        if !*rx.borrow_and_update() {
            return false;
        }
        if debounce.is_zero() {
            return true;
        }

        // Elapsed means the window passed with no drop
        let dropped = tokio::time::timeout(debounce, rx.wait_for(|online| !*online)).await;
        dropped.is_err()
    }
}

impl Default for ConnectivityOracle {
    fn default() -> Self {
        Self::new(true)
    }
}
