//! Plugin configuration
//!
//! Defaults, then an optional `config.json` in the user config directory,
//! then `M365_DECK_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::animation::AnimationTiming;
use crate::storage::keyring::DEFAULT_SERVICE_NAME;

const APP_DIR_NAME: &str = "M365Deck";
const CONFIG_FILENAME: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginConfig {
    pub tenant: String,
    pub authority_host: String,
    pub graph_base_url: String,
    pub scopes: Vec<String>,
    pub keyring_service: String,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub token_refresh_skew_secs: i64,
    /// Directory holding the action glyph PNGs, relative to the plugin
    pub assets_dir: PathBuf,
    pub animation: AnimationTiming,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            tenant: "common".to_string(),
            authority_host: "https://login.microsoftonline.com".to_string(),
            graph_base_url: "https://graph.microsoft.com/v1.0".to_string(),
            scopes: ["offline_access", "user.read", "mail.read", "calendars.read"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            keyring_service: DEFAULT_SERVICE_NAME.to_string(),
            request_timeout_secs: 30,
            poll_interval_secs: 120,
            token_refresh_skew_secs: 300,
            assets_dir: PathBuf::from("Assets"),
            animation: AnimationTiming::default(),
        }
    }
}

impl PluginConfig {
    /// Load from the default location, falling back to defaults on any
    /// file problem.
    pub fn load() -> Self {
        let mut config = match config_path() {
            Ok(path) if path.exists() => Self::from_file(&path).unwrap_or_else(|err| {
                tracing::warn!("Ignoring config file {:?}: {:#}", path, err);
                Self::default()
            }),
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    pub(crate) fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(tenant) = value("M365_DECK_TENANT") {
            self.tenant = tenant;
        }
        if let Some(service) = value("M365_DECK_KEYRING_SERVICE") {
            self.keyring_service = service;
        }
        if let Some(secs) = value("M365_DECK_REQUEST_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.request_timeout_secs = secs;
        }
        if let Some(secs) = value("M365_DECK_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.poll_interval_secs = secs;
        }
    }

    pub fn authority(&self) -> String {
        format!(
            "{}/{}",
            self.authority_host.trim_end_matches('/'),
            self.tenant.trim_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn token_refresh_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_skew_secs.max(0))
    }
}

fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config_dir.join(APP_DIR_NAME).join(CONFIG_FILENAME))
}
