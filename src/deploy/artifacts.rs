//! The agent payload: binaries on local disk, the services they run as, and
//! the settings file the agent reads at startup.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::DeployError;

/// Directory on the device the agent watches for new pages.
pub const DEFAULT_WATCH_DIR: &str = "/home/root/.local/share/remarkable/xochitl";

/// One opaque agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentBinary {
    pub name: String,
    pub local_path: PathBuf,
}

/// A background service on the device, backed by one agent binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentService {
    /// Component key used in status maps.
    pub name: String,
    pub binary: String,
    pub description: String,
}

impl AgentService {
    pub fn unit_name(&self) -> String {
        format!("{}.service", self.binary)
    }
}

/// The services every deployment installs.
pub fn default_services() -> Vec<AgentService> {
    vec![
        AgentService {
            name: "watcher".into(),
            binary: "inkbridge-watcher".into(),
            description: "inkbridge page watcher".into(),
        },
        AgentService {
            name: "pusher".into(),
            binary: "inkbridge-pusher".into(),
            description: "inkbridge page uploader".into(),
        },
    ]
}

/// Everything needed to put the agent on a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentArtifacts {
    pub version: String,
    pub binaries: Vec<AgentBinary>,
    pub services: Vec<AgentService>,
}

impl AgentArtifacts {
    /// The default services, with binaries expected under `dir`.
    pub fn from_dir(dir: &Path, version: impl Into<String>) -> Self {
        let services = default_services();
        let binaries = services
            .iter()
            .map(|s| AgentBinary {
                name: s.binary.clone(),
                local_path: dir.join(&s.binary),
            })
            .collect();
        Self {
            version: version.into(),
            binaries,
            services,
        }
    }

    /// Every binary exists locally and every service has its binary.
    pub fn verify(&self) -> Result<(), DeployError> {
        for binary in &self.binaries {
            if !binary.local_path.is_file() {
                return Err(DeployError::MissingArtifact(format!(
                    "{} (expected at {})",
                    binary.name,
                    binary.local_path.display()
                )));
            }
        }
        for service in &self.services {
            if !self.binaries.iter().any(|b| b.name == service.binary) {
                return Err(DeployError::MissingArtifact(format!(
                    "binary {} for service {}",
                    service.binary, service.name
                )));
            }
        }
        Ok(())
    }
}

/// Written to `config/agent.json` on the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    /// Base URL of the ingestion server as seen from the device.
    pub server_url: String,
    pub api_key: String,
    pub device_id: String,
    pub watch_dir: String,
}

impl AgentSettings {
    pub fn new(server_url: impl Into<String>, api_key: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            api_key: api_key.into(),
            device_id: device_id.into(),
            watch_dir: DEFAULT_WATCH_DIR.to_string(),
        }
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        // Plain strings only; serialization cannot fail.
        serde_json::to_vec_pretty(self).unwrap_or_default()
    }
}
