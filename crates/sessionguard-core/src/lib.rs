//! sessionguard-core - client-side session layer for a token-authenticated
//! backend.
//!
//! This crate provides:
//! - credential storage shared by every context of an origin
//! - bearer-authenticated requests with single-flight refresh and one retry
//! - a synchronous session event bus with cross-context change propagation
//! - idle-timeout forced logout
//! - cached role/capability snapshots and route admission decisions
//!
//! [`session::Origin`] assembles the pieces; each open context gets a
//! [`session::Session`].

pub mod api;
pub mod auth;
pub mod config;
pub mod events;
pub mod guard;
pub mod permissions;
pub mod session;

#[cfg(test)]
mod testutil;

pub use api::{ApiRequest, ApiResponse, AuthorizedClient, HttpResponse, HttpTransport, RequestError, Transport};
pub use auth::{Activity, Credential, CredentialStore, IdleMonitor, IdleState, RefreshCoordinator};
pub use config::Config;
pub use events::{LogoutReason, SessionEvent, SessionEventBus, Subscription};
pub use guard::{Admission, DenialPolicy, RouteGuard, RouteRequirements};
pub use permissions::{PermissionFetchError, PermissionFetcher, PermissionSnapshot, Role};
pub use session::{Origin, Session};
