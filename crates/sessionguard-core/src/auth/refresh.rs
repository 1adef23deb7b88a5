//! Single-flight access token refresh.
//!
//! At most one refresh exchange is in flight at any time. Callers that arrive
//! while one is pending await the same shared future and observe the same
//! outcome. The pending marker is released by the exchange itself as its last
//! step, so the next expiry after a settled refresh starts a fresh attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use super::credentials::CredentialStore;
use crate::api::transport::{ApiRequest, Transport};
use crate::api::TransportError;

type SharedRefresh = Shared<BoxFuture<'static, Option<String>>>;

/// Token pair returned by the token and refresh endpoints. `refresh` is
/// only present on login, or when the backend rotates it.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access: String,
    #[serde(default)]
    pub refresh: Option<String>,
}

/// Why a refresh produced no token. Logged, never returned to callers.
#[derive(Error, Debug)]
enum RefreshFailure {
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("refresh rejected with status {0}")]
    Rejected(u16),

    #[error("malformed refresh response: {0}")]
    Malformed(String),
}

struct Pending {
    generation: u64,
    operation: SharedRefresh,
}

struct RefreshInner {
    store: CredentialStore,
    transport: Arc<dyn Transport>,
    endpoint: String,
    pending: Mutex<Option<Pending>>,
    next_generation: AtomicU64,
    exchanges: AtomicU64,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<RefreshInner>,
}

impl RefreshCoordinator {
    pub fn new(store: CredentialStore, transport: Arc<dyn Transport>, endpoint: &str) -> Self {
        Self {
            inner: Arc::new(RefreshInner {
                store,
                transport,
                endpoint: endpoint.to_string(),
                pending: Mutex::new(None),
                next_generation: AtomicU64::new(0),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// Exchange the stored refresh credential for a new access token.
    ///
    /// Never fails: every failure, including a missing refresh credential,
    /// yields `None`.
    pub async fn refresh(&self) -> Option<String> {
        let operation = {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            match pending.as_ref() {
                Some(in_flight) => {
                    debug!(generation = in_flight.generation, "Joining in-flight token refresh");
                    in_flight.operation.clone()
                }
                None => {
                    let Some(refresh_token) = self.inner.store.refresh_token() else {
                        debug!("No refresh credential stored, nothing to refresh");
                        return None;
                    };
                    let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                    let operation = Self::run(Arc::clone(&self.inner), generation, refresh_token)
                        .boxed()
                        .shared();
                    *pending = Some(Pending {
                        generation,
                        operation: operation.clone(),
                    });
                    operation
                }
            }
        };

        operation.await
    }

    /// Whether a refresh exchange is currently pending.
    pub fn is_pending(&self) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of refresh exchanges started since creation.
    pub fn exchange_count(&self) -> u64 {
        self.inner.exchanges.load(Ordering::Relaxed)
    }

    async fn run(inner: Arc<RefreshInner>, generation: u64, refresh_token: String) -> Option<String> {
        inner.exchanges.fetch_add(1, Ordering::Relaxed);
        debug!(generation, "Starting token refresh");

        let new_access = match inner.exchange(&refresh_token).await {
            Ok(tokens) => {
                // Reuse the presented refresh token unless the backend rotated it.
                let refresh = tokens.refresh.as_deref().unwrap_or(&refresh_token);
                if inner.store.replace_if_refresh(&refresh_token, &tokens.access, refresh) {
                    debug!(generation, rotated = tokens.refresh.is_some(), "Token refresh succeeded");
                    Some(tokens.access)
                } else {
                    debug!(generation, "Session ended during token refresh, result discarded");
                    None
                }
            }
            Err(e) => {
                warn!(generation, error = %e, "Token refresh failed");
                None
            }
        };

        inner.release(generation);
        new_access
    }
}

impl RefreshInner {
    async fn exchange(&self, refresh_token: &str) -> Result<TokenResponse, RefreshFailure> {
        let request = ApiRequest::post(&self.endpoint, json!({ "refresh": refresh_token }));
        let response = self.transport.send(request).await?;

        if !response.is_success() {
            return Err(RefreshFailure::Rejected(response.status));
        }

        let tokens: TokenResponse = serde_json::from_str(&response.body)
            .map_err(|e| RefreshFailure::Malformed(e.to_string()))?;
        if tokens.access.is_empty() {
            return Err(RefreshFailure::Malformed("empty access token".to_string()));
        }
        Ok(tokens)
    }

    fn release(&self, generation: u64) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.as_ref().map(|p| p.generation) == Some(generation) {
            *pending = None;
        }
    }
}
