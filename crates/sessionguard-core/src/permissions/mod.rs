//! Role and capability snapshot of the authenticated identity.
//!
//! The snapshot is fetched lazily from the permissions endpoint, cached for a
//! short freshness window, and dropped whenever the credential changes.

pub mod fetcher;
pub mod snapshot;

use thiserror::Error;

use crate::api::RequestError;

pub use fetcher::{CachedSnapshot, PermissionFetcher, DEFAULT_PERMISSION_STALE_AFTER};
pub use snapshot::{PermissionSnapshot, Role};

/// Kept apart from a denial so views can tell "not allowed" from
/// "could not find out".
#[derive(Error, Debug)]
pub enum PermissionFetchError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Failed to load permissions: {0}")]
    Request(#[from] RequestError),

    #[error("Malformed permissions response: {0}")]
    Malformed(String),
}
