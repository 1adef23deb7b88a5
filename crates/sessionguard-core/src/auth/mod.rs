//! Credential lifecycle.
//!
//! This module provides:
//! - `CredentialStore`: the only owner of the persisted access/refresh slots
//! - `RefreshCoordinator`: single-flight exchange of the refresh credential
//! - `IdleMonitor`: forced logout after a window without user activity
//! - storage backends for the credential slots (memory, file, OS keychain)

pub mod credentials;
pub mod idle;
pub mod refresh;
pub mod storage;

pub use credentials::{Credential, CredentialStore};
pub use idle::{Activity, IdleMonitor, IdleState, DEFAULT_IDLE_TIMEOUT};
pub use refresh::RefreshCoordinator;
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, Slot, StorageBackend};
