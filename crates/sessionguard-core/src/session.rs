//! Session assembly.
//!
//! An [`Origin`] holds what every context of one application shares: the
//! credential backend, the storage-change channel, the transport and the
//! configuration. Each open context (tab, window) gets its own [`Session`]
//! from [`Origin::open_context`], with its own event bus, idle monitor,
//! permission cache and route guard, all reading the same credential slots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{
    ApiRequest, ApiResponse, AuthorizedClient, HttpTransport, RequestError, ResponseBody, Transport,
};
use crate::auth::refresh::TokenResponse;
use crate::auth::{
    Activity, Credential, CredentialStore, FileStorage, IdleMonitor, KeyringStorage, MemoryStorage,
    RefreshCoordinator, StorageBackend,
};
use crate::config::{Config, StorageKind};
use crate::events::{ContextId, SessionEvent, SessionEventBus, StorageChannel, Subscription};
use crate::guard::{Admission, RouteGuard, RouteRequirements};
use crate::permissions::{PermissionFetchError, PermissionFetcher, PermissionSnapshot};

struct OriginInner {
    config: Config,
    backend: Arc<dyn StorageBackend>,
    transport: Arc<dyn Transport>,
    storage_events: StorageChannel,
    next_context: AtomicU64,
}

/// Shared state of all contexts of one application.
#[derive(Clone)]
pub struct Origin {
    inner: Arc<OriginInner>,
}

impl Origin {
    pub fn new(config: Config, backend: Arc<dyn StorageBackend>, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(OriginInner {
                config,
                backend,
                transport,
                storage_events: StorageChannel::new(),
                next_context: AtomicU64::new(1),
            }),
        }
    }

    /// Build the backend and the HTTP transport described by `config`.
    pub fn from_config(config: Config) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = match &config.storage {
            StorageKind::Memory => Arc::new(MemoryStorage::new()),
            StorageKind::File { path } => {
                let path = match path {
                    Some(path) => path.clone(),
                    None => FileStorage::default_path()?,
                };
                Arc::new(FileStorage::new(path))
            }
            StorageKind::Keyring { service } => Arc::new(KeyringStorage::new(service.clone())),
        };
        let transport = Arc::new(HttpTransport::new(&config.backend_url, config.request_timeout())?);
        Ok(Self::new(config, backend, transport))
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Open a new context. Must be called from within a tokio runtime.
    pub fn open_context(&self) -> Session {
        let inner = &self.inner;
        let config = &inner.config;
        let context = ContextId(inner.next_context.fetch_add(1, Ordering::Relaxed));

        let bus = SessionEventBus::new();
        let store = CredentialStore::new(Arc::clone(&inner.backend), bus.clone())
            .shared_with(inner.storage_events.clone(), context);
        let refresher = RefreshCoordinator::new(
            store.clone(),
            Arc::clone(&inner.transport),
            &config.endpoints.token_refresh,
        );
        let client = AuthorizedClient::new(
            Arc::clone(&inner.transport),
            store.clone(),
            refresher.clone(),
            bus.clone(),
        );
        let permissions = PermissionFetcher::new(
            client.clone(),
            store.clone(),
            &bus,
            &config.endpoints.permissions,
            config.permission_stale_after(),
        );
        let guard = RouteGuard::new(store.clone(), permissions.clone(), &config.login_route);
        let idle = IdleMonitor::start(store.clone(), bus.clone(), config.idle_timeout());

        let (authenticated_tx, authenticated) = watch::channel(store.is_authenticated());
        let follower = store.clone();
        let auth_subscription = bus.subscribe(move |event| {
            if matches!(event, SessionEvent::CredentialChanged) {
                authenticated_tx.send_replace(follower.is_authenticated());
            }
        });

        let storage_listener = spawn_storage_listener(&inner.storage_events, bus.clone(), context);
        debug!(%context, "Context opened");

        Session {
            context,
            transport: Arc::clone(&inner.transport),
            token_endpoint: config.endpoints.token.clone(),
            bus,
            store,
            refresher,
            client,
            permissions,
            guard,
            idle,
            authenticated,
            _auth_subscription: auth_subscription,
            storage_listener,
        }
    }
}

/// Re-emit `CredentialChanged` locally when another context mutated the
/// shared slots. The receiver is created before returning so no change
/// published after this call is missed.
fn spawn_storage_listener(channel: &StorageChannel, bus: SessionEventBus, context: ContextId) -> JoinHandle<()> {
    let mut changes = channel.subscribe();
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) if change.source == context => {}
                Ok(change) => {
                    debug!(%context, source = %change.source, "Credential changed in another context");
                    bus.emit(SessionEvent::CredentialChanged);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%context, skipped, "Storage change listener lagged, resynchronizing");
                    bus.emit(SessionEvent::CredentialChanged);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// One open context of the application.
pub struct Session {
    context: ContextId,
    transport: Arc<dyn Transport>,
    token_endpoint: String,
    bus: SessionEventBus,
    store: CredentialStore,
    refresher: RefreshCoordinator,
    client: AuthorizedClient,
    permissions: PermissionFetcher,
    guard: RouteGuard,
    idle: IdleMonitor,
    authenticated: watch::Receiver<bool>,
    _auth_subscription: Subscription,
    storage_listener: JoinHandle<()>,
}

impl Session {
    /// Exchange email and password for a credential pair and store it.
    ///
    /// Sent without a bearer and outside the refresh path, so rejected
    /// credentials come back as `RequestError::Http` with the backend's
    /// message instead of ending some other session.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), RequestError> {
        let request = ApiRequest::post(
            &self.token_endpoint,
            json!({ "email": email, "password": password }),
        );
        let response = self.transport.send(request).await?;
        let body = ResponseBody::from_response(&response);
        if !response.is_success() {
            return Err(RequestError::Http {
                status: response.status,
                body,
            });
        }

        let tokens: TokenResponse = ApiResponse {
            status: response.status,
            body,
        }
        .json()?;
        if tokens.access.is_empty() {
            return Err(RequestError::InvalidResponse("empty access token".to_string()));
        }

        self.store.set(&tokens.access, tokens.refresh.as_deref());
        info!(context = %self.context, "Logged in");
        Ok(())
    }

    /// User-initiated logout. Announces `CredentialChanged` only.
    pub fn logout(&self) {
        self.store.clear();
        info!(context = %self.context, "Logged out");
    }

    pub fn is_authenticated(&self) -> bool {
        self.store.is_authenticated()
    }

    /// Authenticated flag that follows every credential change, including
    /// changes made by other contexts.
    pub fn watch_authenticated(&self) -> watch::Receiver<bool> {
        self.authenticated.clone()
    }

    pub fn credential(&self) -> Option<Credential> {
        self.store.get()
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        self.client.execute(request).await
    }

    pub async fn permissions(&self, force_refresh: bool) -> Result<PermissionSnapshot, PermissionFetchError> {
        self.permissions.get(force_refresh).await
    }

    pub async fn admit(&self, requested_path: &str, requirements: &RouteRequirements) -> Admission {
        self.guard.admit(requested_path, requirements).await
    }

    pub fn record_activity(&self, activity: Activity) {
        self.idle.record_activity(activity);
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn events(&self) -> &SessionEventBus {
        &self.bus
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn client(&self) -> &AuthorizedClient {
        &self.client
    }

    pub fn refresher(&self) -> &RefreshCoordinator {
        &self.refresher
    }

    pub fn permission_fetcher(&self) -> &PermissionFetcher {
        &self.permissions
    }

    pub fn guard(&self) -> &RouteGuard {
        &self.guard
    }

    pub fn idle(&self) -> &IdleMonitor {
        &self.idle
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.storage_listener.abort();
        debug!(context = %self.context, "Context closed");
    }
}
