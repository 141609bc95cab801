//! Application configuration.
//!
//! Loaded from `config.toml` in the platform config directory; a missing
//! file means defaults. `INKBRIDGE_*` environment variables (a `.env` file
//! works too) override the file, and CLI flags override both.
//!
//! ```toml
//! [device]
//! host = "10.11.99.1"
//! password = "..."
//!
//! [server]
//! port = 8080
//! api_key = "ink_..."
//!
//! [sync]
//! interval_secs = 300
//! batch_size = 25
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cloud::DEFAULT_BASE_URL;
use crate::ingest::{DEFAULT_API_KEY_PREFIX, DEFAULT_PORT};
use crate::queue::DEFAULT_BATCH_SIZE;
use crate::remote::{Credential, DeviceTarget};
use crate::sync::DEFAULT_SYNC_INTERVAL;

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub server: ServerConfig,
    pub cloud: CloudConfig,
    pub sync: SyncConfig,
    pub deploy: DeployConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// USB-networking address of the tablet.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
    pub device_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "10.11.99.1".into(),
            port: 22,
            username: "root".into(),
            password: None,
            key_file: None,
            device_id: "tablet".into(),
        }
    }
}

impl DeviceConfig {
    /// Key file wins over password when both are set.
    pub fn target(&self) -> Result<DeviceTarget> {
        let credential = match (&self.key_file, &self.password) {
            (Some(path), _) => Credential::KeyFile {
                path: path.clone(),
                passphrase: None,
            },
            (None, Some(password)) => Credential::Password {
                password: password.clone(),
            },
            (None, None) => anyhow::bail!(
                "no device credential configured; set device.password or device.key_file"
            ),
        };
        Ok(DeviceTarget {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            credential,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Address the device uses to reach this machine.
    pub public_host: String,
    pub api_key: String,
    pub api_key_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            public_host: "10.11.99.2".into(),
            api_key: String::new(),
            api_key_prefix: DEFAULT_API_KEY_PREFIX.into(),
        }
    }
}

impl ServerConfig {
    pub fn public_url(&self) -> String {
        format!("http://{}:{}", self.public_host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloudConfig {
    pub base_url: String,
    pub access_token: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            access_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    /// Finished pages older than this are purged by `cleanup`.
    pub retention_days: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SYNC_INTERVAL.as_secs(),
            batch_size: DEFAULT_BATCH_SIZE,
            retention_days: 30,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Cleanup age for `days`, falling back to `retention_days`.
    pub fn retention(&self, days: Option<u64>) -> Duration {
        let days = days.unwrap_or(self.retention_days);
        Duration::from_secs(days.saturating_mul(24 * 60 * 60))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeployConfig {
    /// Directory holding the agent binaries; defaults to `{data_dir}/agent`.
    pub artifacts_dir: Option<PathBuf>,
    pub version: Option<String>,
}

impl AppConfig {
    /// Read `path`, or return defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load the default config file and apply environment overrides.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::load_from(&default_config_path())?;
        config.apply_env_with(|key| dotenvy::var(key).ok())?;
        Ok(config)
    }

    /// Overlay `INKBRIDGE_*` values produced by `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("INKBRIDGE_DEVICE_HOST") {
            self.device.host = host;
        }
        if let Some(password) = lookup("INKBRIDGE_DEVICE_PASSWORD") {
            self.device.password = Some(password);
        }
        if let Some(port) = lookup("INKBRIDGE_SERVER_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("INKBRIDGE_SERVER_PORT={port:?} is not a port"))?;
        }
        if let Some(key) = lookup("INKBRIDGE_API_KEY") {
            self.server.api_key = key;
        }
        if let Some(token) = lookup("INKBRIDGE_CLOUD_TOKEN") {
            self.cloud.access_token = Some(token);
        }
        if let Some(secs) = lookup("INKBRIDGE_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = secs
                .parse()
                .with_context(|| format!("INKBRIDGE_SYNC_INTERVAL_SECS={secs:?} is not a number"))?;
        }
        Ok(())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "inkbridge", "inkbridge")
}

pub fn default_config_path() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from(CONFIG_FILE),
        |dirs| dirs.config_dir().join(CONFIG_FILE),
    )
}

pub fn default_data_dir() -> PathBuf {
    project_dirs().map_or_else(
        || PathBuf::from(".inkbridge"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}
