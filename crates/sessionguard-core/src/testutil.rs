//! Shared test helpers, available to all `#[cfg(test)]` modules in the crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::api::transport::{ApiRequest, HttpResponse, Transport};
use crate::api::TransportError;
use crate::auth::storage::MemoryStorage;
use crate::auth::CredentialStore;
use crate::events::{SessionEvent, SessionEventBus, Subscription};

type Responder = dyn Fn(&ApiRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Transport that answers from a closure and records every request.
pub struct ScriptedTransport {
    responder: Box<Responder>,
    latency: Duration,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            latency: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Delay every response. Only meaningful before the transport is shared.
    pub fn with_latency(self: Arc<Self>, latency: Duration) -> Arc<Self> {
        match Arc::try_unwrap(self) {
            Ok(mut transport) => {
                transport.latency = latency;
                Arc::new(transport)
            }
            Err(_) => panic!("with_latency called on a shared transport"),
        }
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn count_path(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    /// Bearer tokens presented to `path`, in order.
    pub fn bearers_for(&self, path: &str) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .map(|r| r.bearer.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: ApiRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.responder)(&request)
    }
}

/// A credential store over fresh in-memory slots.
pub fn memory_store() -> (CredentialStore, SessionEventBus) {
    let bus = SessionEventBus::new();
    let store = CredentialStore::new(Arc::new(MemoryStorage::new()), bus.clone());
    (store, bus)
}

/// Record every event emitted on `bus` while the subscription is alive.
pub fn record_events(bus: &SessionEventBus) -> (Arc<Mutex<Vec<SessionEvent>>>, Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let subscription = bus.subscribe(move |event| sink.lock().unwrap().push(event.clone()));
    (events, subscription)
}

pub fn force_logouts(events: &Arc<Mutex<Vec<SessionEvent>>>) -> Vec<SessionEvent> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SessionEvent::ForceLogout(_)))
        .cloned()
        .collect()
}
