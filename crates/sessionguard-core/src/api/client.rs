//! Authorized request execution.
//!
//! `AuthorizedClient` attaches the current access credential to each request.
//! An auth failure triggers one refresh through the shared coordinator and a
//! single retry with the new token. When no token can be obtained the session
//! is terminated here, and only here: the store is cleared and
//! `ForceLogout(refresh_failed)` is emitted on this context's bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::error::{RequestError, ResponseBody};
use super::transport::{ApiRequest, HttpResponse, Transport};
use crate::auth::{CredentialStore, RefreshCoordinator};
use crate::events::{LogoutReason, SessionEvent, SessionEventBus, Subscription};

const STATUS_UNAUTHORIZED: u16 = 401;

/// A successful (2xx) response with its body normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: ResponseBody,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RequestError> {
        let value = match &self.body {
            ResponseBody::Json(value) => value.clone(),
            ResponseBody::Empty => serde_json::Value::Null,
            ResponseBody::Text(_) => {
                return Err(RequestError::InvalidResponse(
                    "expected a JSON body".to_string(),
                ))
            }
        };
        serde_json::from_value(value).map_err(|e| RequestError::InvalidResponse(e.to_string()))
    }
}

#[derive(Clone)]
pub struct AuthorizedClient {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    refresher: RefreshCoordinator,
    bus: SessionEventBus,
    /// Set once this context has announced a refresh-failed logout, cleared
    /// when a credential is stored again. Concurrent failures in one context
    /// produce a single event; other contexts keep their own flag.
    logout_announced: Arc<AtomicBool>,
    _subscription: Arc<Subscription>,
}

impl AuthorizedClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        refresher: RefreshCoordinator,
        bus: SessionEventBus,
    ) -> Self {
        let logout_announced = Arc::new(AtomicBool::new(false));
        let rearm = Arc::clone(&logout_announced);
        let follower = store.clone();
        let subscription = bus.subscribe(move |event| {
            if matches!(event, SessionEvent::CredentialChanged) && follower.is_authenticated() {
                rearm.store(false, Ordering::SeqCst);
            }
        });

        Self {
            transport,
            store,
            refresher,
            bus,
            logout_announced,
            _subscription: Arc::new(subscription),
        }
    }

    /// Send `request` with the current credential, refreshing and retrying
    /// once on an auth failure.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, RequestError> {
        let response = self.send(&request, self.store.access_token()).await?;
        if response.status != STATUS_UNAUTHORIZED {
            return Self::into_result(response);
        }

        debug!(path = %request.path, "Access token rejected, refreshing");
        match self.refresher.refresh().await {
            Some(new_access) => {
                let retried = self.send(&request, Some(new_access)).await?;
                Self::into_result(retried)
            }
            None => {
                self.store.clear();
                if !self.logout_announced.swap(true, Ordering::SeqCst) {
                    info!(reason = %LogoutReason::RefreshFailed, "Session terminated");
                    self.bus
                        .emit(SessionEvent::ForceLogout(LogoutReason::RefreshFailed));
                }
                Err(RequestError::Unauthorized)
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        self.execute(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_value(body)
            .map_err(|e| RequestError::InvalidResponse(format!("unserializable body: {}", e)))?;
        self.execute(ApiRequest::post(path, body)).await?.json()
    }

    async fn send(
        &self,
        request: &ApiRequest,
        token: Option<String>,
    ) -> Result<HttpResponse, RequestError> {
        let outgoing = request.clone().with_bearer(token);
        let response = self.transport.send(outgoing).await?;
        debug!(method = %request.method, path = %request.path, status = response.status, "Request completed");
        Ok(response)
    }

    fn into_result(response: HttpResponse) -> Result<ApiResponse, RequestError> {
        let body = ResponseBody::from_response(&response);
        match response.status {
            200..=299 => Ok(ApiResponse {
                status: response.status,
                body,
            }),
            STATUS_UNAUTHORIZED => Err(RequestError::Unauthorized),
            status => Err(RequestError::Http { status, body }),
        }
    }
}
