//! Session layer configuration.
//!
//! Configuration is read from `~/.config/sessionguard/config.json` (when
//! present) and then overridden by environment variables, with `.env`
//! honoured:
//!
//! - `SESSIONGUARD_BACKEND_URL`
//! - `SESSIONGUARD_IDLE_TIMEOUT_SECS`
//! - `SESSIONGUARD_PERMISSION_STALE_SECS`
//! - `SESSIONGUARD_REQUEST_TIMEOUT_SECS`

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::idle::DEFAULT_IDLE_TIMEOUT;
use crate::auth::storage::DEFAULT_KEYRING_SERVICE;
use crate::guard::DEFAULT_LOGIN_ROUTE;
use crate::permissions::DEFAULT_PERMISSION_STALE_AFTER;

/// Application name used for config directory paths
const APP_NAME: &str = "sessionguard";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_BACKEND_URL: &str = "http://localhost:8000";

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = DEFAULT_IDLE_TIMEOUT.as_secs();

const DEFAULT_PERMISSION_STALE_SECS: u64 = DEFAULT_PERMISSION_STALE_AFTER.as_secs();

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const ENV_BACKEND_URL: &str = "SESSIONGUARD_BACKEND_URL";
const ENV_IDLE_TIMEOUT: &str = "SESSIONGUARD_IDLE_TIMEOUT_SECS";
const ENV_PERMISSION_STALE: &str = "SESSIONGUARD_PERMISSION_STALE_SECS";
const ENV_REQUEST_TIMEOUT: &str = "SESSIONGUARD_REQUEST_TIMEOUT_SECS";

/// Backend endpoint paths, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub token: String,
    pub token_refresh: String,
    pub permissions: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            token: "/auth/token".to_string(),
            token_refresh: "/auth/token/refresh".to_string(),
            permissions: "/permissions".to_string(),
        }
    }
}

/// Where the credential slots live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageKind {
    Memory,
    /// JSON file; `None` uses the user data directory.
    File { path: Option<PathBuf> },
    Keyring { service: String },
}

impl Default for StorageKind {
    fn default() -> Self {
        StorageKind::Keyring {
            service: DEFAULT_KEYRING_SERVICE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    pub idle_timeout_secs: u64,
    pub permission_stale_secs: u64,
    pub request_timeout_secs: u64,
    pub login_route: String,
    pub endpoints: Endpoints,
    pub storage: StorageKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            permission_stale_secs: DEFAULT_PERMISSION_STALE_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
            endpoints: Endpoints::default(),
            storage: StorageKind::default(),
        }
    }
}

impl Config {
    /// Config file, then environment.
    pub fn load() -> Result<Self> {
        // Load .env file if present (silently ignore if not found)
        let _ = dotenvy::dotenv();

        let path = Self::config_path()?;
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.apply_env()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BACKEND_URL).filter(|v| !v.trim().is_empty()) {
            self.backend_url = url.trim().to_string();
        }
        if let Some(secs) = parse_override(&lookup, ENV_IDLE_TIMEOUT)? {
            self.idle_timeout_secs = secs;
        }
        if let Some(secs) = parse_override(&lookup, ENV_PERMISSION_STALE)? {
            self.permission_stale_secs = secs;
        }
        if let Some(secs) = parse_override(&lookup, ENV_REQUEST_TIMEOUT)? {
            self.request_timeout_secs = secs;
        }
        Ok(self)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn permission_stale_after(&self) -> Duration {
        Duration::from_secs(self.permission_stale_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn parse_override<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => {
            let value = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {}: {:?}", name, raw))?;
            Ok(Some(value))
        }
        _ => Ok(None),
    }
}
