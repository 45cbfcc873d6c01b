//! Settings storage
//!
//! Persists the daemon's `ServerConfig` as pretty JSON and keeps the live copy
//! that every command handler reads.

use crate::storage::StorageError;
use crate::types::config::ServerConfig;
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};

/// Live configuration backed by a JSON file
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<ServerConfig>,
}

impl ConfigStore {
    /// Open the store, loading the file if present
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load_settings(&path);
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current configuration
    pub fn get(&self) -> ServerConfig {
        self.current.read().clone()
    }

    /// Mutate the configuration and write it to disk.
    ///
    /// The in-memory copy is only replaced once the file write succeeded.
    pub fn update<F>(&self, f: F) -> Result<ServerConfig, StorageError>
    where
        F: FnOnce(&mut ServerConfig),
    {
        let mut guard = self.current.write();
        let mut next = guard.clone();
        f(&mut next);
        save_settings(&self.path, &next)?;
        *guard = next.clone();
        Ok(next)
    }
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings(path: &Path) -> ServerConfig {
    match load_settings_internal(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            ServerConfig::default()
        }
    }
}

fn load_settings_internal(path: &Path) -> Result<ServerConfig, StorageError> {
    if !path.exists() {
        tracing::info!("Config file not found, using defaults");
        return Ok(ServerConfig::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: ServerConfig = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!(path = %path.display(), "Loaded config from disk");
    Ok(settings)
}

/// Save settings to disk
pub fn save_settings(path: &Path, settings: &ServerConfig) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved config to disk");
    Ok(())
}
