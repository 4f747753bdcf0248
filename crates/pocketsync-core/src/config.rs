//! Application configuration management.
//!
//! Holds the backend location, the last signed-in owner and cache tuning.
//! Stored at `~/.config/pocketsync/config.json`. The API key is never written
//! to disk; it comes from the environment only.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cache::{EntityType, FALLBACK_MAX_AGE_MS};

/// Application name used for config directory paths
const APP_NAME: &str = "pocketsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_BACKEND_URL: &str = "POCKETSYNC_BACKEND_URL";
pub const ENV_API_KEY: &str = "POCKETSYNC_API_KEY";
pub const ENV_OWNER: &str = "POCKETSYNC_OWNER";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub backend_url: Option<String>,
    pub last_owner: Option<String>,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    #[serde(default = "default_fallback_max_age_ms")]
    pub fallback_max_age_ms: i64,
    /// Per-entity overrides of the default freshness windows.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_age_ms: BTreeMap<EntityType, i64>,
    /// Background revalidation period; off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revalidate_interval_secs: Option<u64>,
}

fn default_fallback_max_age_ms() -> i64 {
    FALLBACK_MAX_AGE_MS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fallback_max_age_ms: FALLBACK_MAX_AGE_MS,
            max_age_ms: BTreeMap::new(),
            revalidate_interval_secs: None,
        }
    }
}

impl Config {
    /// Load from the default location with environment overrides applied.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Missing file gives the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("Invalid config {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Overlay environment values. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(url) = lookup(ENV_BACKEND_URL) {
            self.backend_url = Some(url);
        }
        if let Some(owner) = lookup(ENV_OWNER) {
            self.last_owner = Some(owner);
        }
    }

    /// Backend URL without a trailing slash.
    pub fn backend_url(&self) -> Result<String> {
        let url = self
            .backend_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("No backend URL configured (set {})", ENV_BACKEND_URL))?;
        Ok(url.trim_end_matches('/').to_string())
    }

    pub fn api_key() -> Result<String> {
        std::env::var(ENV_API_KEY).with_context(|| format!("{} is not set", ENV_API_KEY))
    }
}
