//! TOML-based configuration for the Pod Manager core, with environment
//! variable override support.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Root configuration for the Pod Manager core.
///
/// Scoped to what this crate itself owns: poll-loop pacing and the local
/// persistence path. HTTP, queue, and auth settings belong to collaborators
/// outside this crate's boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PodManagerConfig {
    pub polling: PollingConfig,
    pub conversation: ConversationConfig,
    /// Path to the SQLite database backing `pod-store`'s `Repository`.
    pub store_path: String,
}

impl Default for PodManagerConfig {
    fn default() -> Self {
        Self {
            polling: PollingConfig::default(),
            conversation: ConversationConfig::default(),
            store_path: "./pod-manager.sqlite3".to_string(),
        }
    }
}

/// Tunables for the purge/prime/bolus wait-and-poll loops (spec §4.1.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Milliseconds added on top of the per-tick delay for purge/prime waits.
    pub purge_prime_fixed_delay_ms: u64,
    /// Milliseconds per 0.05 U tick for purge/prime waits.
    pub purge_prime_ms_per_tick: u64,
    /// Fixed milliseconds added to bolus wait delays.
    pub bolus_fixed_delay_ms: u64,
    /// Milliseconds per 0.05 U tick for the bolus wait loop.
    pub bolus_ms_per_tick: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            purge_prime_fixed_delay_ms: 200,
            purge_prime_ms_per_tick: 1000,
            bolus_fixed_delay_ms: 500,
            bolus_ms_per_tick: 2000,
        }
    }
}

/// Tunables for the per-pod conversation mutex.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Default bounded-wait timeout in milliseconds when `start_conversation`
    /// is called with a non-zero timeout.
    pub default_timeout_ms: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
        }
    }
}

impl PodManagerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}

const CONFIG_PATHS: &[&str] = &["pod-manager.toml", "./config/pod-manager.toml"];

/// Loads `PodManagerConfig` from file (if found) with environment overrides.
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<PodManagerConfig, ConfigError> {
        let mut config = PodManagerConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "loading pod manager configuration from file");
            config = PodManagerConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("POD_MANAGER_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut PodManagerConfig) {
        if let Ok(val) = env::var("POD_MANAGER_STORE_PATH") {
            config.store_path = val;
        }
        if let Ok(val) = env::var("POD_MANAGER_CONVERSATION_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.conversation.default_timeout_ms = ms;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = PodManagerConfig::default();
        assert_eq!(config.polling.bolus_ms_per_tick, 2000);
        assert_eq!(config.polling.purge_prime_ms_per_tick, 1000);
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pod-manager.toml");
        std::fs::write(
            &path,
            r#"
            store_path = "/tmp/custom.sqlite3"

            [polling]
            bolus_fixed_delay_ms = 750
            "#,
        )
        .unwrap();

        let config = PodManagerConfig::from_file(&path).unwrap();
        assert_eq!(config.store_path, "/tmp/custom.sqlite3");
        assert_eq!(config.polling.bolus_fixed_delay_ms, 750);
        // untouched fields keep their defaults
        assert_eq!(config.polling.bolus_ms_per_tick, 2000);
    }
}
