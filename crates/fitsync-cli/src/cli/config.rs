use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fitsync_core::models::Identity;
use fitsync_core::{RestConfig, SyncConfig};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.json";

/// CLI configuration that can be loaded from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CliConfig {
    /// Hosted backing store; commands other than `demo` need it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<RestConfig>,

    /// Signed-in user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,

    /// Sync tunables; anything omitted keeps its default
    #[serde(default)]
    pub sync: SyncConfig,
}

impl CliConfig {
    /// `<config dir>/fitsync/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fitsync").join(CONFIG_FILE))
    }

    /// Load config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Explicit path if given, else the default file when it exists, else
    /// an empty config.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: CliConfig = serde_json::from_str(json).context("Failed to deserialize config")?;
        config.sync = config.sync.with_env_overrides();
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn require_backend(&self) -> Result<&RestConfig> {
        self.backend
            .as_ref()
            .context("No backend configured (set \"backend\" in the config file)")
    }

    pub fn require_identity(&self) -> Result<&Identity> {
        self.identity
            .as_ref()
            .context("No identity configured (set \"identity\" in the config file)")
    }
}
