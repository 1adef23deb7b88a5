use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};

use super::storage::{Slot, StorageBackend};
use crate::events::{ContextId, SessionEvent, SessionEventBus, StorageChannel};

/// An issued access/refresh pair. Both values are opaque and only forwarded.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access: String,
    pub refresh: Option<String>,
}

// Never print token values.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access", &"<redacted>")
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Owner of the persisted credential slots for one context.
///
/// Every mutation is followed by `CredentialChanged` on the local bus and a
/// notification on the storage channel for the other contexts. Clone is cheap
/// and clones share the same serialization lock.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
    bus: SessionEventBus,
    channel: Option<(StorageChannel, ContextId)>,
    write_lock: Arc<Mutex<()>>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>, bus: SessionEventBus) -> Self {
        Self {
            backend,
            bus,
            channel: None,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Announce mutations on `channel` as coming from `context`.
    pub fn shared_with(mut self, channel: StorageChannel, context: ContextId) -> Self {
        self.channel = Some((channel, context));
        self
    }

    /// Current credential, or `None` when not authenticated.
    ///
    /// Backend read failures are logged and read as "absent".
    pub fn get(&self) -> Option<Credential> {
        // Both slots under the write lock so a concurrent `set` is never seen half-applied.
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let access = self.read_slot(Slot::Access)?;
        let refresh = self.read_slot(Slot::Refresh);
        Some(Credential { access, refresh })
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_slot(Slot::Access)
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read_slot(Slot::Refresh)
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token().is_some()
    }

    /// Overwrite the access credential. The refresh credential is only
    /// replaced when a new one is supplied.
    pub fn set(&self, access: &str, refresh: Option<&str>) {
        {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.write_slot(Slot::Access, access);
            if let Some(refresh) = refresh {
                self.write_slot(Slot::Refresh, refresh);
            }
        }
        debug!(rotated_refresh = refresh.is_some(), "Credential stored");
        self.notify();
    }

    /// Store a refreshed pair, but only if the stored refresh credential is
    /// still `expected`. Returns `false` and leaves the store untouched when a
    /// logout or a new login replaced it in the meantime.
    pub fn replace_if_refresh(&self, expected: &str, access: &str, refresh: &str) -> bool {
        {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            if self.read_slot(Slot::Refresh).as_deref() != Some(expected) {
                debug!("Refresh credential changed underneath, discarding refreshed token");
                return false;
            }
            self.write_slot(Slot::Access, access);
            if refresh != expected {
                self.write_slot(Slot::Refresh, refresh);
            }
        }
        debug!(rotated_refresh = refresh != expected, "Refreshed credential stored");
        self.notify();
        true
    }

    /// Remove both credentials. Always announces the change, even when the
    /// store was already empty.
    ///
    /// Returns whether an access credential was present beforehand.
    pub fn clear(&self) -> bool {
        let was_authenticated = {
            let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            let was_authenticated = self.read_slot(Slot::Access).is_some();
            self.remove_slot(Slot::Access);
            self.remove_slot(Slot::Refresh);
            was_authenticated
        };
        debug!(was_authenticated, "Credential cleared");
        self.notify();
        was_authenticated
    }

    pub fn events(&self) -> &SessionEventBus {
        &self.bus
    }

    fn notify(&self) {
        self.bus.emit(SessionEvent::CredentialChanged);
        if let Some((channel, context)) = &self.channel {
            channel.publish(*context);
        }
    }

    fn read_slot(&self, slot: Slot) -> Option<String> {
        match self.backend.read(slot) {
            Ok(value) => value,
            Err(e) => {
                warn!(slot = slot.key(), error = %e, "Failed to read credential slot");
                None
            }
        }
    }

    fn write_slot(&self, slot: Slot, value: &str) {
        if let Err(e) = self.backend.write(slot, value) {
            warn!(slot = slot.key(), error = %e, "Failed to write credential slot");
        }
    }

    fn remove_slot(&self, slot: Slot) {
        if let Err(e) = self.backend.remove(slot) {
            warn!(slot = slot.key(), error = %e, "Failed to remove credential slot");
        }
    }
}
