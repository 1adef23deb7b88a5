//! Session event broadcasting.
//!
//! Every open context (tab, window, embedded view) owns a [`SessionEventBus`]
//! that dispatches [`SessionEvent`]s synchronously to its subscribers. Contexts
//! of the same origin are linked by a [`StorageChannel`]: a credential mutation
//! in one context is announced there so the others can re-emit
//! `CredentialChanged` on their own bus.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of the cross-context storage channel. Receivers that fall
/// further behind than this resynchronize from the store.
const STORAGE_CHANNEL_CAPACITY: usize = 64;

/// Why a session was terminated without the user asking for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum LogoutReason {
    /// No user activity for the whole idle window.
    Idle,
    /// The refresh credential could not be exchanged for a new access token.
    RefreshFailed,
}

impl LogoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogoutReason::Idle => "idle",
            LogoutReason::RefreshFailed => "refresh_failed",
        }
    }
}

impl fmt::Display for LogoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The stored credential was written or removed. Handlers should re-read
    /// the store; the event carries no payload.
    CredentialChanged,
    /// The session is over. The store has already been cleared.
    ForceLogout(LogoutReason),
}

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler)>>,
}

impl BusInner {
    fn remove(&self, id: u64) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(handler_id, _)| *handler_id != id);
    }
}

/// Synchronous, in-order event dispatch for one context.
///
/// There is no queue: an event emitted while nobody is subscribed is gone.
/// Clone is cheap and every clone refers to the same subscriber list.
#[derive(Clone, Default)]
pub struct SessionEventBus {
    inner: Arc<BusInner>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. It stays registered until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver `event` to every current subscriber, in subscription order.
    pub fn emit(&self, event: SessionEvent) {
        // Snapshot the list so handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<Handler> = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in handlers {
            handler(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle returned by [`SessionEventBus::subscribe`].
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.id);
        }
    }
}

/// Identifies one context within an origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Notification that the shared credential slots were mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageChange {
    pub source: ContextId,
}

/// Same-origin storage-change channel shared by every context.
#[derive(Clone)]
pub struct StorageChannel {
    sender: broadcast::Sender<StorageChange>,
}

impl StorageChannel {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(STORAGE_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, source: ContextId) {
        // No receivers simply means no other context is open.
        let _ = self.sender.send(StorageChange { source });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageChange> {
        self.sender.subscribe()
    }
}

impl Default for StorageChannel {
    fn default() -> Self {
        Self::new()
    }
}
