use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::defaults;
use crate::error::{Result, SyncError};

/// Tunables for the sync core. Every field has a default, so a partial JSON
/// document is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub auto_dismiss_ms: u64,
    pub appear_ms: u64,
    pub dismiss_ms: u64,
    pub evaluation_recheck_ms: u64,
    pub push_recheck_ms: u64,
    pub unread_debounce_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub window_capacity: usize,
    pub heartbeat_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_dismiss_ms: defaults::AUTO_DISMISS_MS,
            appear_ms: defaults::APPEAR_MS,
            dismiss_ms: defaults::DISMISS_MS,
            evaluation_recheck_ms: defaults::EVALUATION_RECHECK_MS,
            push_recheck_ms: defaults::PUSH_RECHECK_MS,
            unread_debounce_ms: defaults::UNREAD_DEBOUNCE_MS,
            reconnect_initial_ms: defaults::RECONNECT_INITIAL_MS,
            reconnect_max_ms: defaults::RECONNECT_MAX_MS,
            window_capacity: defaults::WINDOW_CAPACITY,
            heartbeat_ms: defaults::HEARTBEAT_MS,
        }
    }
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SyncError::decode("sync config", e))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| SyncError::Decode {
            what: "sync config",
            message: format!("{}: {}", path.display(), e),
        })?;
        Self::from_json(&content)
    }

    /// Apply `FITSYNC_*_MS` environment overrides on top of this config.
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
        }

        if let Some(v) = env_u64("FITSYNC_AUTO_DISMISS_MS") {
            self.auto_dismiss_ms = v;
        }
        if let Some(v) = env_u64("FITSYNC_EVALUATION_RECHECK_MS") {
            self.evaluation_recheck_ms = v;
        }
        if let Some(v) = env_u64("FITSYNC_PUSH_RECHECK_MS") {
            self.push_recheck_ms = v;
        }
        if let Some(v) = env_u64("FITSYNC_UNREAD_DEBOUNCE_MS") {
            self.unread_debounce_ms = v;
        }
        if let Some(v) = env_u64("FITSYNC_RECONNECT_MAX_MS") {
            self.reconnect_max_ms = v;
        }
        self
    }

    pub fn auto_dismiss(&self) -> Duration {
        Duration::from_millis(self.auto_dismiss_ms)
    }

    pub fn appear_duration(&self) -> Duration {
        Duration::from_millis(self.appear_ms)
    }

    pub fn dismiss_duration(&self) -> Duration {
        Duration::from_millis(self.dismiss_ms)
    }

    pub fn evaluation_recheck_delay(&self) -> Duration {
        Duration::from_millis(self.evaluation_recheck_ms)
    }

    pub fn push_recheck_delay(&self) -> Duration {
        Duration::from_millis(self.push_recheck_ms)
    }

    pub fn unread_debounce(&self) -> Duration {
        Duration::from_millis(self.unread_debounce_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{"autoDismissMs": 5000}"#).unwrap();
        assert_eq!(config.auto_dismiss(), Duration::from_secs(5));
        assert_eq!(config.window_capacity, defaults::WINDOW_CAPACITY);
        assert_eq!(config.push_recheck_ms, defaults::PUSH_RECHECK_MS);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"windowCapacity": 50, "unreadDebounceMs": 10}}"#).unwrap();

        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.window_capacity, 50);
        assert_eq!(config.unread_debounce(), Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_json_is_decode_error() {
        let err = SyncConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, SyncError::Decode { what: "sync config", .. }));
    }

    #[test]
    fn test_reconnect_max_never_below_initial() {
        let config = SyncConfig {
            reconnect_initial_ms: 5_000,
            reconnect_max_ms: 100,
            ..SyncConfig::default()
        };
        assert_eq!(config.reconnect_max(), Duration::from_secs(5));
    }
}
