//! Persistent slots for the access and refresh credentials.
//!
//! Three backends are provided:
//! - `MemoryStorage`: process-local, shared by every context of an origin
//! - `FileStorage`: a JSON file in the user data directory
//! - `KeyringStorage`: the OS keychain

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};

/// Application name used for the data directory
const APP_NAME: &str = "sessionguard";

/// Credential file name in the data directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Default keychain service name
pub const DEFAULT_KEYRING_SERVICE: &str = "sessionguard";

/// The two named credential slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Access,
    Refresh,
}

impl Slot {
    pub fn key(&self) -> &'static str {
        match self {
            Slot::Access => "access_token",
            Slot::Refresh => "refresh_token",
        }
    }
}

/// Durable key/value holder for the credential slots.
///
/// Only the credential store talks to a backend; everything else goes
/// through the store.
pub trait StorageBackend: Send + Sync {
    fn read(&self, slot: Slot) -> Result<Option<String>>;
    fn write(&self, slot: Slot, value: &str) -> Result<()>;
    fn remove(&self, slot: Slot) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    slots: Mutex<HashMap<Slot, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn read(&self, slot: Slot) -> Result<Option<String>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots.get(&slot).cloned())
    }

    fn write(&self, slot: Slot, value: &str) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(slot, value.to_string());
        Ok(())
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(&slot);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CredentialFile {
    access_token: Option<String>,
    refresh_token: Option<String>,
    updated_at: Option<DateTime<Utc>>,
}

impl CredentialFile {
    fn slot_mut(&mut self, slot: Slot) -> &mut Option<String> {
        match slot {
            Slot::Access => &mut self.access_token,
            Slot::Refresh => &mut self.refresh_token,
        }
    }
}

/// Credential slots persisted as a JSON file.
pub struct FileStorage {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<data_dir>/sessionguard/credentials.json`
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join(CREDENTIALS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<CredentialFile> {
        if !self.path.exists() {
            return Ok(CredentialFile::default());
        }
        let contents = std::fs::read_to_string(&self.path)
            .context("Failed to read credential file")?;
        serde_json::from_str(&contents).context("Failed to parse credential file")
    }

    fn save(&self, file: &CredentialFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(file)?;
        std::fs::write(&self.path, contents).context("Failed to write credential file")?;
        Ok(())
    }

    fn update(&self, slot: Slot, value: Option<&str>) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        *file.slot_mut(slot) = value.map(str::to_string);

        if file.access_token.is_none() && file.refresh_token.is_none() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove credential file")?;
            }
            return Ok(());
        }

        file.updated_at = Some(Utc::now());
        self.save(&file)
    }
}

impl StorageBackend for FileStorage {
    fn read(&self, slot: Slot) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = self.load()?;
        Ok(file.slot_mut(slot).take())
    }

    fn write(&self, slot: Slot, value: &str) -> Result<()> {
        self.update(slot, Some(value))
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        self.update(slot, None)
    }
}

/// Credential slots stored in the OS keychain, one entry per slot.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, slot: Slot) -> Result<Entry> {
        Entry::new(&self.service, slot.key()).context("Failed to create keyring entry")
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new(DEFAULT_KEYRING_SERVICE)
    }
}

impl StorageBackend for KeyringStorage {
    fn read(&self, slot: Slot) -> Result<Option<String>> {
        match self.entry(slot)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve credential from keychain"),
        }
    }

    fn write(&self, slot: Slot, value: &str) -> Result<()> {
        self.entry(slot)?
            .set_password(value)
            .context("Failed to store credential in keychain")
    }

    fn remove(&self, slot: Slot) -> Result<()> {
        match self.entry(slot)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete credential from keychain"),
        }
    }
}
