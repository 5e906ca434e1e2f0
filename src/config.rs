//! Configuration loading and persistence.
//!
//! Reads `config.json` from the config directory and applies `AIRQ_*`
//! environment variable overrides on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::constants::{APNS_KEY_FILE, CONFIG_FILE, DEFAULT_APNS_TOPIC, DEFAULT_BIND_ADDR};

/// APNs provider settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ApnsConfig {
    /// Path to the provider signing key (`.p8`, PKCS#8 PEM).
    pub key_path: PathBuf,
    /// Key identifier from the developer portal (JWT `kid`).
    pub key_id: String,
    /// Developer team identifier (JWT `iss`).
    pub team_id: String,
    /// App bundle identifier sent as `apns-topic`.
    pub topic: String,
    /// Use the development gateway instead of production.
    pub sandbox: bool,
}

impl Default for ApnsConfig {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from(APNS_KEY_FILE),
            key_id: String::new(),
            team_id: String::new(),
            topic: DEFAULT_APNS_TOPIC.to_string(),
            sandbox: true,
        }
    }
}

/// Configuration for the airquality hub.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP service listens on.
    pub bind_addr: String,
    /// Directory holding `tokens.data`, `key.key` and `nonce.key`.
    pub data_dir: PathBuf,
    /// Push delivery settings.
    pub apns: ApnsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            data_dir: PathBuf::from("."),
            apns: ApnsConfig::default(),
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `AIRQ_CONFIG_DIR` env var: explicit override
    /// 2. Default: platform config dir (e.g. `~/.config/airquality-hub`)
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(custom_dir) = std::env::var("AIRQ_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("airquality-hub")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Defaults rooted at `dir`: data and the APNs key live beside the config.
    pub fn defaults_in(dir: &Path) -> Self {
        let mut config = Self {
            data_dir: dir.to_path_buf(),
            ..Self::default()
        };
        config.apns.key_path = dir.join(APNS_KEY_FILE);
        config
    }

    /// Loads configuration from the config directory, with environment variable overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?)
    }

    /// Loads `config.json` from `dir` (defaults if absent), then applies env overrides.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?
        } else {
            Self::defaults_in(dir)
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(bind_addr) = std::env::var("AIRQ_BIND_ADDR") {
            self.bind_addr = bind_addr;
        }

        if let Ok(data_dir) = std::env::var("AIRQ_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(key_path) = std::env::var("AIRQ_APNS_KEY_PATH") {
            self.apns.key_path = PathBuf::from(key_path);
        }

        if let Ok(key_id) = std::env::var("AIRQ_APNS_KEY_ID") {
            self.apns.key_id = key_id;
        }

        if let Ok(team_id) = std::env::var("AIRQ_APNS_TEAM_ID") {
            self.apns.team_id = team_id;
        }

        if let Ok(topic) = std::env::var("AIRQ_APNS_TOPIC") {
            self.apns.topic = topic;
        }

        if let Ok(sandbox) = std::env::var("AIRQ_APNS_SANDBOX") {
            if let Ok(sandbox) = sandbox.parse::<bool>() {
                self.apns.sandbox = sandbox;
            }
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir/config.json` (owner read/write only).
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Path of the token log.
    pub fn token_log_path(&self) -> PathBuf {
        self.data_dir.join(crate::constants::TOKEN_LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bind_addr, "0.0.0.0:5050");
        assert_eq!(config.apns.topic, "com.harr1424.AirQuality");
        assert!(config.apns.sandbox);
    }

    #[test]
    fn test_defaults_in_roots_paths_at_dir() {
        let dir = TempDir::new().unwrap();
        let config = Config::defaults_in(dir.path());
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.apns.key_path, dir.path().join("apnkey.p8"));
        assert_eq!(config.token_log_path(), dir.path().join("tokens.data"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::defaults_in(dir.path());
        config.bind_addr = "127.0.0.1:6060".to_string();
        config.apns.key_id = "ABC123".to_string();
        config.save_to(dir.path()).unwrap();

        let loaded: Config = serde_json::from_str(
            &fs::read_to_string(dir.path().join("config.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_save_writes_to_config_dir() {
        let dir = TempDir::new().unwrap();
        std::env::set_var("AIRQ_CONFIG_DIR", dir.path());

        let mut config = Config::defaults_in(dir.path());
        config.apns.team_id = "TEAM42".to_string();
        config.save().unwrap();

        let config_path = dir.path().join("config.json");
        let loaded: Config =
            serde_json::from_str(&fs::read_to_string(&config_path).unwrap()).unwrap();
        assert_eq!(loaded.apns.team_id, "TEAM42");

        #[cfg(unix)]
        assert_eq!(
            fs::metadata(&config_path).unwrap().permissions().mode() & 0o777,
            0o600
        );

        std::env::remove_var("AIRQ_CONFIG_DIR");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let loaded: Config = serde_json::from_str(r#"{"bind_addr":"127.0.0.1:1"}"#).unwrap();
        assert_eq!(loaded.bind_addr, "127.0.0.1:1");
        assert_eq!(loaded.apns.topic, "com.harr1424.AirQuality");
    }
}
