//! Persisted user settings: API key and system prompt.
//!
//! Stored as a flat, pretty-printed JSON record at a well-known path and
//! overwritten wholesale on every save. Loading never fails: a missing or
//! corrupt file yields an empty record, exactly as if nothing was saved.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "PDFCHAT_CONFIG";

/// The persisted settings record.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub api_key: String,
    pub system_prompt: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_key", &mask_key(&self.api_key))
            .field("system_prompt", &self.system_prompt)
            .finish()
    }
}

/// Keep the first characters of a key for recognisability, hide the rest.
pub fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let visible: String = key.chars().take(8).collect();
    format!("{visible}…")
}

/// Reads and writes [`Config`] at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `$PDFCHAT_CONFIG`, else `<config dir>/pdfchat/config.json`, else
    /// `./config.json` on platforms without a config directory.
    pub fn from_env_or_default() -> Self {
        if let Some(p) = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty()) {
            return Self::new(p);
        }
        Self::new(Self::default_path().unwrap_or_else(|| PathBuf::from("config.json")))
    }

    /// Platform default location of the config file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pdfchat").join("config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved config; empty record when absent or unreadable.
    pub async fn load(&self) -> Config {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}", self.path.display());
                return Config::default();
            }
            Err(e) => {
                error!("Error loading config {}: {e}", self.path.display());
                return Config::default();
            }
        };

        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!("Ignoring corrupt config {}: {e}", self.path.display());
            Config::default()
        })
    }

    /// Write the config, replacing whatever was there.
    pub async fn try_save(&self, config: &Config) -> Result<(), SessionError> {
        let io_err = |source| SessionError::ConfigIo {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(config)
            .map_err(|e| SessionError::Internal(format!("serialise config: {e}")))?;
        tokio::fs::write(&self.path, json).await.map_err(io_err)?;

        debug!("Saved config to {}", self.path.display());
        Ok(())
    }

    /// [`ConfigStore::try_save`], reduced to a success flag.
    pub async fn save(&self, config: &Config) -> bool {
        match self.try_save(config).await {
            Ok(()) => true,
            Err(e) => {
                error!("Error saving config: {e}");
                false
            }
        }
    }
}
