//! Configuration loading for mailroom.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::storage::BackendKind;

/// Get the mailroom home directory (~/.mailroom).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".mailroom"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.mailroom/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.queue.max_retries == 0 {
        return Err(Error::Config(
            "queue.max_retries must be at least 1".to_string(),
        ));
    }
    if settings.queue.lock_ttl_ms <= 0 {
        return Err(Error::Config(
            "queue.lock_ttl_ms must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

/// Queue behavior configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueConfig {
    /// Which persistence backend holds queue state.
    #[serde(default)]
    pub backend: BackendKind,
    /// Override for the file-backend state directory.
    pub state_dir: Option<PathBuf>,
    /// Override for the SQLite database path.
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: i64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_recovery_max_ms")]
    pub recovery_max_ms: i64,
}

fn default_max_retries() -> u32 {
    crate::backoff::MAX_RETRIES
}

fn default_lock_ttl_ms() -> i64 {
    crate::lock::DEFAULT_LOCK_TTL_MS
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_recovery_max_ms() -> i64 {
    crate::recovery::DEFAULT_MAX_RECOVERY_MS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            state_dir: None,
            db_path: None,
            max_retries: default_max_retries(),
            lock_ttl_ms: default_lock_ttl_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            recovery_max_ms: default_recovery_max_ms(),
        }
    }
}

/// Mailroom settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueConfig,
}

impl Settings {
    /// State directory for the file backend, defaulting under the home dir.
    pub fn resolve_state_dir(&self) -> Result<PathBuf> {
        match &self.queue.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_home_dir()?.join("state")),
        }
    }

    /// Database path for the SQLite backend, defaulting under the home dir.
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        match &self.queue.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("queue.db")),
        }
    }
}
