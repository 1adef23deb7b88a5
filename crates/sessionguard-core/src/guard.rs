//! Route admission.
//!
//! Every navigation to a protected view is decided here:
//!
//! - no credential: redirect to login, remembering the requested path
//! - credential, snapshot not yet known: render a neutral loading state
//! - credential and snapshot: check the role allow-list and the required
//!   capabilities, then render or apply the route's [`DenialPolicy`]
//!
//! Routes that only need a credential are admitted without a snapshot.

use serde::Serialize;

use crate::auth::CredentialStore;
use crate::permissions::{PermissionFetchError, PermissionFetcher, PermissionSnapshot, Role};

/// Default login view
pub const DEFAULT_LOGIN_ROUTE: &str = "/login";

/// How a denied navigation is presented.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DenialPolicy {
    /// Navigate to the snapshot's own dashboard route.
    #[default]
    Redirect,
    /// Navigate to a fixed fallback route.
    RedirectTo(String),
    /// Stay on the route and render a "not authorized" panel.
    InlinePanel,
}

/// What a protected route requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRequirements {
    /// `None` admits every role.
    pub roles: Option<Vec<Role>>,
    pub capabilities: Vec<String>,
    pub on_denied: DenialPolicy,
}

impl RouteRequirements {
    /// Any authenticated user.
    pub fn authenticated() -> Self {
        Self::default()
    }

    pub fn roles(roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            roles: Some(roles.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn require_capability(mut self, name: impl Into<String>) -> Self {
        self.capabilities.push(name.into());
        self
    }

    pub fn redirect_to(mut self, fallback: impl Into<String>) -> Self {
        self.on_denied = DenialPolicy::RedirectTo(fallback.into());
        self
    }

    pub fn inline_panel(mut self) -> Self {
        self.on_denied = DenialPolicy::InlinePanel;
        self
    }

    /// Whether admission depends on the permission snapshot at all.
    pub fn needs_snapshot(&self) -> bool {
        self.roles.is_some() || !self.capabilities.is_empty()
    }

    pub fn is_satisfied_by(&self, snapshot: &PermissionSnapshot) -> bool {
        let role_ok = self
            .roles
            .as_ref()
            .map(|roles| roles.contains(&snapshot.role))
            .unwrap_or(true);
        let capabilities_ok = self
            .capabilities
            .iter()
            .all(|name| snapshot.has_capability(name));
        role_ok && capabilities_ok
    }
}

/// Outcome of one navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum Admission {
    Render,
    Loading,
    RedirectToLogin { login_route: String, return_to: String },
    Redirect { to: String },
    NotAuthorized,
    PermissionError { message: String },
}

/// What is known about the snapshot at decision time.
#[derive(Debug, Clone, Copy)]
pub enum SnapshotState<'a> {
    Pending,
    Ready(&'a PermissionSnapshot),
    Failed(&'a PermissionFetchError),
}

/// Pure admission decision.
pub fn evaluate(
    requested_path: &str,
    authenticated: bool,
    snapshot: SnapshotState<'_>,
    requirements: &RouteRequirements,
    login_route: &str,
) -> Admission {
    if !authenticated {
        return Admission::RedirectToLogin {
            login_route: login_route.to_string(),
            return_to: requested_path.to_string(),
        };
    }
    if !requirements.needs_snapshot() {
        return Admission::Render;
    }

    let snapshot = match snapshot {
        SnapshotState::Pending => return Admission::Loading,
        SnapshotState::Failed(PermissionFetchError::NotAuthenticated) => {
            return Admission::RedirectToLogin {
                login_route: login_route.to_string(),
                return_to: requested_path.to_string(),
            }
        }
        SnapshotState::Failed(e) => {
            return Admission::PermissionError {
                message: e.to_string(),
            }
        }
        SnapshotState::Ready(snapshot) => snapshot,
    };

    if requirements.is_satisfied_by(snapshot) {
        return Admission::Render;
    }

    match &requirements.on_denied {
        DenialPolicy::InlinePanel => Admission::NotAuthorized,
        DenialPolicy::RedirectTo(fallback) => Admission::Redirect {
            to: fallback.clone(),
        },
        DenialPolicy::Redirect => Admission::Redirect {
            to: snapshot.dashboard_route.clone(),
        },
    }
}

#[derive(Clone)]
pub struct RouteGuard {
    store: CredentialStore,
    permissions: PermissionFetcher,
    login_route: String,
}

impl RouteGuard {
    pub fn new(store: CredentialStore, permissions: PermissionFetcher, login_route: &str) -> Self {
        Self {
            store,
            permissions,
            login_route: login_route.to_string(),
        }
    }

    /// Decide a navigation, fetching the snapshot when needed.
    pub async fn admit(&self, requested_path: &str, requirements: &RouteRequirements) -> Admission {
        let authenticated = self.store.is_authenticated();
        if !authenticated || !requirements.needs_snapshot() {
            return self.decide(requested_path, authenticated, SnapshotState::Pending, requirements);
        }

        match self.permissions.get(false).await {
            Ok(snapshot) => self.decide(
                requested_path,
                self.store.is_authenticated(),
                SnapshotState::Ready(&snapshot),
                requirements,
            ),
            Err(e) => self.decide(
                requested_path,
                self.store.is_authenticated(),
                SnapshotState::Failed(&e),
                requirements,
            ),
        }
    }

    /// Decide from what is known right now. A missing snapshot is `Loading`.
    pub fn peek(&self, requested_path: &str, requirements: &RouteRequirements) -> Admission {
        let snapshot = self.permissions.cached();
        let state = match snapshot {
            Some(ref snapshot) => SnapshotState::Ready(snapshot),
            None => SnapshotState::Pending,
        };
        self.decide(requested_path, self.store.is_authenticated(), state, requirements)
    }

    pub fn login_route(&self) -> &str {
        &self.login_route
    }

    fn decide(
        &self,
        requested_path: &str,
        authenticated: bool,
        snapshot: SnapshotState<'_>,
        requirements: &RouteRequirements,
    ) -> Admission {
        evaluate(requested_path, authenticated, snapshot, requirements, &self.login_route)
    }
}
