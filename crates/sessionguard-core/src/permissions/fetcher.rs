use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use super::snapshot::PermissionSnapshot;
use super::PermissionFetchError;
use crate::api::{ApiRequest, AuthorizedClient, ResponseBody};
use crate::auth::CredentialStore;
use crate::events::{SessionEvent, SessionEventBus, Subscription};

/// Default freshness window for a fetched snapshot.
pub const DEFAULT_PERMISSION_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    pub snapshot: PermissionSnapshot,
    pub fetched_at: Instant,
    pub cached_at: DateTime<Utc>,
}

impl CachedSnapshot {
    fn new(snapshot: PermissionSnapshot) -> Self {
        Self {
            snapshot,
            fetched_at: Instant::now(),
            cached_at: Utc::now(),
        }
    }

    pub fn is_stale(&self, stale_after: Duration) -> bool {
        self.fetched_at.elapsed() > stale_after
    }
}

/// Cache slot plus a generation that moves on every credential change, so a
/// fetch started under an older credential never lands in the cache.
#[derive(Default)]
struct CacheSlot {
    generation: u64,
    entry: Option<CachedSnapshot>,
}

impl CacheSlot {
    fn invalidate(&mut self) {
        self.generation += 1;
        self.entry = None;
    }
}

#[derive(Clone)]
pub struct PermissionFetcher {
    client: AuthorizedClient,
    store: CredentialStore,
    endpoint: String,
    stale_after: Duration,
    cache: Arc<Mutex<CacheSlot>>,
    _subscription: Arc<Subscription>,
}

impl PermissionFetcher {
    pub fn new(
        client: AuthorizedClient,
        store: CredentialStore,
        bus: &SessionEventBus,
        endpoint: &str,
        stale_after: Duration,
    ) -> Self {
        let cache = Arc::new(Mutex::new(CacheSlot::default()));

        let on_change = Arc::clone(&cache);
        let subscription = bus.subscribe(move |event| {
            if matches!(event, SessionEvent::CredentialChanged) {
                on_change
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .invalidate();
            }
        });

        Self {
            client,
            store,
            endpoint: endpoint.to_string(),
            stale_after,
            cache,
            _subscription: Arc::new(subscription),
        }
    }

    /// Current snapshot, from cache while fresh unless `force_refresh`.
    pub async fn get(&self, force_refresh: bool) -> Result<PermissionSnapshot, PermissionFetchError> {
        if !self.store.is_authenticated() {
            return Err(PermissionFetchError::NotAuthenticated);
        }

        let generation = {
            let slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if !force_refresh {
                if let Some(ref entry) = slot.entry {
                    if !entry.is_stale(self.stale_after) {
                        return Ok(entry.snapshot.clone());
                    }
                }
            }
            slot.generation
        };

        debug!(force_refresh, "Fetching permission snapshot");
        let response = self.client.execute(ApiRequest::get(&self.endpoint)).await?;
        let snapshot = match response.body {
            ResponseBody::Json(ref body) => PermissionSnapshot::from_json(body)?,
            _ => {
                return Err(PermissionFetchError::Malformed(
                    "expected a JSON body".to_string(),
                ))
            }
        };

        let mut slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.generation == generation {
            slot.entry = Some(CachedSnapshot::new(snapshot.clone()));
        } else {
            debug!("Credential changed during permission fetch, not caching");
        }
        Ok(snapshot)
    }

    /// Fresh cached snapshot, without touching the network.
    pub fn cached(&self) -> Option<PermissionSnapshot> {
        let slot = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        slot.entry
            .as_ref()
            .filter(|entry| !entry.is_stale(self.stale_after))
            .map(|entry| entry.snapshot.clone())
    }

    pub fn cache_entry(&self) -> Option<CachedSnapshot> {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry
            .clone()
    }

    pub fn invalidate(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HttpResponse, RequestError, TransportError};
    use crate::auth::RefreshCoordinator;
    use crate::permissions::Role;
    use crate::testutil::{memory_store, ScriptedTransport};
    use serde_json::json;

    const PERMISSIONS_PATH: &str = "/permissions";
    const STALE_AFTER: Duration = DEFAULT_PERMISSION_STALE_AFTER;

    fn fetcher(store: &CredentialStore, bus: &SessionEventBus, transport: &Arc<ScriptedTransport>) -> PermissionFetcher {
        let refresher = RefreshCoordinator::new(store.clone(), transport.clone(), "/auth/token/refresh");
        let client = AuthorizedClient::new(transport.clone(), store.clone(), refresher, bus.clone());
        PermissionFetcher::new(client, store.clone(), bus, PERMISSIONS_PATH, STALE_AFTER)
    }

    fn customer_backend() -> Arc<ScriptedTransport> {
        ScriptedTransport::new(|_| {
            Ok(HttpResponse::json(
                200,
                &json!({"role": "customer", "capabilities": {"can_submit_claims": true}, "dashboard_route": "/dashboard"}),
            ))
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_is_cached_until_stale() {
        let (store, bus) = memory_store();
        store.set("A1", Some("R1"));
        let transport = customer_backend();
        let fetcher = fetcher(&store, &bus, &transport);

        let snapshot = fetcher.get(false).await.unwrap();
        assert_eq!(snapshot.role, Role::Customer);
        fetcher.get(false).await.unwrap();
        assert_eq!(transport.count_path(PERMISSIONS_PATH), 1);
        assert_eq!(fetcher.cached(), Some(snapshot.clone()));
        let entry = fetcher.cache_entry().unwrap();
        assert!(entry.cached_at <= Utc::now());

        tokio::time::advance(STALE_AFTER + Duration::from_secs(1)).await;
        assert_eq!(fetcher.cached(), None);
        // The stale entry stays inspectable until it is replaced
        let stale = fetcher.cache_entry().unwrap();
        assert!(stale.is_stale(STALE_AFTER));
        assert_eq!(stale.snapshot, snapshot);
        fetcher.get(false).await.unwrap();
        assert_eq!(transport.count_path(PERMISSIONS_PATH), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_cache() {
        let (store, bus) = memory_store();
        store.set("A1", Some("R1"));
        let transport = customer_backend();
        let fetcher = fetcher(&store, &bus, &transport);

        fetcher.get(false).await.unwrap();
        fetcher.get(true).await.unwrap();
        assert_eq!(transport.count_path(PERMISSIONS_PATH), 2);
    }

    #[tokio::test]
    async fn test_credential_change_invalidates_cache() {
        let (store, bus) = memory_store();
        store.set("A1", Some("R1"));
        let transport = customer_backend();
        let fetcher = fetcher(&store, &bus, &transport);

        fetcher.get(false).await.unwrap();
        assert!(fetcher.cached().is_some());

        store.set("B1", Some("S1"));
        assert!(fetcher.cached().is_none());
        fetcher.get(false).await.unwrap();
        assert_eq!(transport.bearers_for(PERMISSIONS_PATH).last().unwrap().as_deref(), Some("B1"));
    }

    #[tokio::test]
    async fn test_requires_credential() {
        let (store, bus) = memory_store();
        let transport = customer_backend();
        let fetcher = fetcher(&store, &bus, &transport);

        let err = fetcher.get(false).await.unwrap_err();
        assert!(matches!(err, PermissionFetchError::NotAuthenticated));
        assert_eq!(transport.request_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_surfaced_not_treated_as_logout() {
        let (store, bus) = memory_store();
        store.set("A1", Some("R1"));
        let transport = ScriptedTransport::new(|_| Ok(HttpResponse::text(503, "maintenance")));
        let fetcher = fetcher(&store, &bus, &transport);

        let err = fetcher.get(false).await.unwrap_err();
        assert!(matches!(
            err,
            PermissionFetchError::Request(RequestError::Http { status: 503, .. })
        ));
        assert!(store.is_authenticated());
        assert!(fetcher.cached().is_none());
    }

    #[tokio::test]
    async fn test_network_failure_is_surfaced() {
        let (store, bus) = memory_store();
        store.set("A1", Some("R1"));
        let transport = ScriptedTransport::new(|_| Err(TransportError::Connection("reset".into())));
        let fetcher = fetcher(&store, &bus, &transport);

        let err = fetcher.get(false).await.unwrap_err();
        assert!(matches!(err, PermissionFetchError::Request(RequestError::Network(_))));
    }

    #[tokio::test]
    async fn test_refresh_during_fetch_is_not_cached() {
        let (store, bus) = memory_store();
        store.set("A1", Some("R1"));
        let transport = ScriptedTransport::new(|request| {
            Ok(match (request.path.as_str(), request.bearer.as_deref()) {
                ("/auth/token/refresh", _) => HttpResponse::json(200, &json!({"access": "A2"})),
                (_, Some("A2")) => HttpResponse::json(200, &json!({"role": "manager"})),
                _ => HttpResponse::empty(401),
            })
        });
        let fetcher = fetcher(&store, &bus, &transport);

        let snapshot = fetcher.get(false).await.unwrap();
        assert_eq!(snapshot.role, Role::Manager);
        assert_eq!(snapshot.dashboard_route, "/admin-dashboard");
        // The refresh announced a credential change mid-flight
        assert!(fetcher.cached().is_none());
    }
}
