//! Device agent deployment over the remote session.
//!
//! Installs, updates, verifies and removes the on-device agent. The agent
//! binaries are opaque files; this module only copies them, wires them into
//! systemd and checks that they came up.
//!
//! # Stages
//!
//! A deploy walks these stages in order, reporting each through the progress
//! callback:
//!
//! 1. **Checking** - session alive, current install state
//! 2. **PreparingFiles** - local artifacts present, root remounted rw, dirs
//! 3. **UploadingBinaries** - agent binaries copied with mode 0755
//! 4. **ConfiguringServices** - unit files, agent config, version manifest
//! 5. **StartingServices** - daemon-reload, enable, restart
//! 6. **Verifying** - re-run [`Orchestrator::check_installation`]
//! 7. **Complete**
//!
//! Any stage error aborts the deploy. Nothing is rolled back: every step
//! overwrites or is a no-op when already applied, so running the deploy again
//! is the recovery path.
//!
//! # Example
//!
//! ```rust,ignore
//! use inkbridge::deploy::{AgentArtifacts, AgentSettings, Orchestrator};
//!
//! let mut session = RemoteSession::connect(&target)?;
//! let mut orchestrator = Orchestrator::new(&mut session, artifacts, settings);
//! let status = orchestrator.deploy(|p| println!("{}: {}", p.stage, p.message))?;
//! ```

pub mod artifacts;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{EventBus, SyncEvent};
use crate::remote::{RemoteError, RemoteShell, shell_quote};

pub use artifacts::{AgentArtifacts, AgentBinary, AgentService, AgentSettings};

// =============================================================================
// Constants
// =============================================================================

/// Install marker directory on the device.
pub const INSTALL_DIR: &str = "/home/root/.inkbridge";

/// Where systemd looks for unit files on the device.
pub const SYSTEMD_DIR: &str = "/etc/systemd/system";

/// Scratch location for configuration during an update.
pub const BACKUP_DIR: &str = "/tmp/inkbridge-backup";

/// Component key for the cache marker in [`DeploymentStatus::components`].
pub const CACHE_COMPONENT: &str = "cache";

/// Version reported when the manifest exists but cannot be parsed.
pub const UNKNOWN_VERSION: &str = "unknown";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that abort a deployment.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("{stage} failed: {source}")]
    Stage {
        stage: DeployStage,
        #[source]
        source: RemoteError,
    },

    #[error("Missing agent artifact: {0}")]
    MissingArtifact(String),

    #[error("Verification failed: {0}")]
    Verification(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl DeployError {
    /// Attach `stage` to a bare remote error.
    fn at(self, stage: DeployStage) -> Self {
        match self {
            Self::Remote(source) => Self::Stage { stage, source },
            other => other,
        }
    }
}

// =============================================================================
// Progress Types
// =============================================================================

/// Current stage of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    Checking,
    PreparingFiles,
    UploadingBinaries,
    ConfiguringServices,
    StartingServices,
    Verifying,
    Complete,
    Failed { error: String },
}

impl std::fmt::Display for DeployStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployStage::Checking => write!(f, "Checking"),
            DeployStage::PreparingFiles => write!(f, "Preparing files"),
            DeployStage::UploadingBinaries => write!(f, "Uploading binaries"),
            DeployStage::ConfiguringServices => write!(f, "Configuring services"),
            DeployStage::StartingServices => write!(f, "Starting services"),
            DeployStage::Verifying => write!(f, "Verifying"),
            DeployStage::Complete => write!(f, "Complete"),
            DeployStage::Failed { error } => write!(f, "Failed: {}", error),
        }
    }
}

/// Progress update during a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployProgress {
    pub stage: DeployStage,
    pub message: String,
    /// Overall completion in `0.0..=1.0`.
    pub fraction: f32,
    pub elapsed: Duration,
}

/// Progress callback that publishes every update as [`SyncEvent::Deploy`].
pub fn progress_publisher(events: EventBus) -> impl Fn(DeployProgress) + Send + Sync + 'static {
    move |progress| events.publish(SyncEvent::Deploy(progress))
}

/// What a check, deploy, update or uninstall found on the device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeploymentStatus {
    pub is_installed: bool,
    pub version: Option<String>,
    /// Service name (or [`CACHE_COMPONENT`]) to health.
    pub components: BTreeMap<String, bool>,
    /// Non-fatal problems (backup/restore, best-effort uninstall steps).
    pub warnings: Vec<String>,
}

impl DeploymentStatus {
    pub fn state(&self) -> DeploymentState {
        if self.is_installed {
            DeploymentState::Installed {
                version: self
                    .version
                    .clone()
                    .unwrap_or_else(|| UNKNOWN_VERSION.to_string()),
                components: self.components.clone(),
            }
        } else {
            DeploymentState::NotInstalled
        }
    }

    pub fn all_components_healthy(&self) -> bool {
        self.is_installed && self.components.values().all(|ok| *ok)
    }
}

/// Installed-or-not view of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentState {
    NotInstalled,
    Installed {
        version: String,
        components: BTreeMap<String, bool>,
    },
}

/// Contents of `version.json` on the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionManifest {
    pub version: String,
    pub installed_at: String,
    pub components: Vec<String>,
}

// =============================================================================
// Remote layout
// =============================================================================

/// Paths of the agent installation on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    pub root: String,
    pub unit_dir: String,
}

impl Default for RemoteLayout {
    fn default() -> Self {
        Self {
            root: INSTALL_DIR.to_string(),
            unit_dir: SYSTEMD_DIR.to_string(),
        }
    }
}

impl RemoteLayout {
    pub fn bin_dir(&self) -> String {
        format!("{}/bin", self.root)
    }

    pub fn config_dir(&self) -> String {
        format!("{}/config", self.root)
    }

    pub fn cache_dir(&self) -> String {
        format!("{}/cache", self.root)
    }

    pub fn cache_marker(&self) -> String {
        format!("{}/.initialized", self.cache_dir())
    }

    pub fn manifest_path(&self) -> String {
        format!("{}/version.json", self.root)
    }

    pub fn agent_config_path(&self) -> String {
        format!("{}/agent.json", self.config_dir())
    }

    pub fn unit_path(&self, service: &AgentService) -> String {
        format!("{}/{}", self.unit_dir, service.unit_name())
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Drives install/update/uninstall over one exclusively borrowed session.
pub struct Orchestrator<'s, S: RemoteShell + ?Sized> {
    shell: &'s mut S,
    layout: RemoteLayout,
    artifacts: AgentArtifacts,
    settings: AgentSettings,
}

impl<'s, S: RemoteShell + ?Sized> Orchestrator<'s, S> {
    pub fn new(shell: &'s mut S, artifacts: AgentArtifacts, settings: AgentSettings) -> Self {
        Self {
            shell,
            layout: RemoteLayout::default(),
            artifacts,
            settings,
        }
    }

    /// Use a non-default install location.
    pub fn with_layout(mut self, layout: RemoteLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    /// Inspect the device.
    ///
    /// A missing install directory is a normal answer (`is_installed =
    /// false`), not an error. An unreadable manifest still counts as
    /// installed, with version [`UNKNOWN_VERSION`].
    pub fn check_installation(&mut self) -> Result<DeploymentStatus, DeployError> {
        let mut status = DeploymentStatus::default();

        if !self.remote_test("-d", &self.layout.root.clone())? {
            info!(root = %self.layout.root, "agent not installed");
            return Ok(status);
        }
        status.is_installed = true;

        let manifest_cmd = format!("cat {}", shell_quote(&self.layout.manifest_path()));
        let raw = self.shell.execute(&manifest_cmd)?;
        status.version = Some(match parse_manifest(&raw.stdout) {
            Some(manifest) => manifest.version,
            None => {
                warn!(path = %self.layout.manifest_path(), "version manifest unreadable");
                UNKNOWN_VERSION.to_string()
            }
        });

        for service in self.artifacts.services.clone() {
            let cmd = format!("systemctl is-active {}", service.unit_name());
            let output = self.shell.execute(&cmd)?;
            status
                .components
                .insert(service.name.clone(), output.stdout.trim() == "active");
        }

        let cache_present = self.remote_test("-f", &self.layout.cache_marker())?;
        status
            .components
            .insert(CACHE_COMPONENT.to_string(), cache_present);

        Ok(status)
    }

    /// Install or reinstall the agent.
    pub fn deploy<F>(&mut self, on_progress: F) -> Result<DeploymentStatus, DeployError>
    where
        F: Fn(DeployProgress),
    {
        let start = Instant::now();
        let result = self.run_deploy(&on_progress, start);
        match &result {
            Ok(status) => {
                on_progress(DeployProgress {
                    stage: DeployStage::Complete,
                    message: format!(
                        "Agent {} deployed in {:.1}s",
                        status.version.as_deref().unwrap_or(UNKNOWN_VERSION),
                        start.elapsed().as_secs_f64()
                    ),
                    fraction: 1.0,
                    elapsed: start.elapsed(),
                });
            }
            Err(e) => {
                warn!(error = %e, "deploy aborted");
                on_progress(DeployProgress {
                    stage: DeployStage::Failed {
                        error: e.to_string(),
                    },
                    message: format!("Deployment failed: {}", e),
                    fraction: 1.0,
                    elapsed: start.elapsed(),
                });
            }
        }
        result
    }

    fn run_deploy<F>(&mut self, on_progress: &F, start: Instant) -> Result<DeploymentStatus, DeployError>
    where
        F: Fn(DeployProgress),
    {
        let report = |stage: DeployStage, message: String, fraction: f32| {
            on_progress(DeployProgress {
                stage,
                message,
                fraction,
                elapsed: start.elapsed(),
            })
        };

        // 1. Checking
        report(DeployStage::Checking, "Checking device...".into(), 0.0);
        if !self.shell.is_connected() {
            return Err(DeployError::Stage {
                stage: DeployStage::Checking,
                source: RemoteError::NotConnected,
            });
        }
        let before = self
            .check_installation()
            .map_err(|e| e.at(DeployStage::Checking))?;
        report(
            DeployStage::Checking,
            match &before.version {
                Some(v) => format!("Found agent {} installed", v),
                None => "No agent installed".into(),
            },
            0.05,
        );

        // 2. PreparingFiles
        report(
            DeployStage::PreparingFiles,
            "Preparing remote filesystem...".into(),
            0.1,
        );
        self.artifacts.verify()?;
        let layout = self.layout.clone();
        self.run_stage(DeployStage::PreparingFiles, "mount -o remount,rw /")?;
        let mkdir = format!(
            "mkdir -p {} {} {} {}",
            shell_quote(&layout.bin_dir()),
            shell_quote(&layout.config_dir()),
            shell_quote(&layout.cache_dir()),
            shell_quote(&layout.unit_dir)
        );
        self.run_stage(DeployStage::PreparingFiles, &mkdir)?;

        // 3. UploadingBinaries
        let binaries = self.artifacts.binaries.clone();
        let total = binaries.len().max(1) as f32;
        for (i, binary) in binaries.iter().enumerate() {
            report(
                DeployStage::UploadingBinaries,
                format!("Uploading {}...", binary.name),
                0.2 + 0.4 * (i as f32 / total),
            );
            let remote_path = format!("{}/{}", layout.bin_dir(), binary.name);
            self.shell
                .upload_file(&binary.local_path, &remote_path, 0o755)
                .map_err(|source| DeployError::Stage {
                    stage: DeployStage::UploadingBinaries,
                    source,
                })?;
        }

        // 4. ConfiguringServices
        report(
            DeployStage::ConfiguringServices,
            "Writing service definitions...".into(),
            0.65,
        );
        for service in self.artifacts.services.clone() {
            let unit = render_unit(&service, &layout);
            self.upload_stage(
                DeployStage::ConfiguringServices,
                unit.as_bytes(),
                &layout.unit_path(&service),
                0o644,
            )?;
        }
        let agent_config = self.settings.to_json_bytes();
        self.upload_stage(
            DeployStage::ConfiguringServices,
            &agent_config,
            &layout.agent_config_path(),
            0o600,
        )?;
        self.upload_stage(
            DeployStage::ConfiguringServices,
            b"",
            &layout.cache_marker(),
            0o644,
        )?;
        let manifest = VersionManifest {
            version: self.artifacts.version.clone(),
            installed_at: chrono::Utc::now().to_rfc3339(),
            components: self
                .artifacts
                .services
                .iter()
                .map(|s| s.name.clone())
                .collect(),
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| DeployError::Verification(format!("manifest encoding failed: {e}")))?;
        self.upload_stage(
            DeployStage::ConfiguringServices,
            &manifest_bytes,
            &layout.manifest_path(),
            0o644,
        )?;

        // 5. StartingServices
        report(
            DeployStage::StartingServices,
            "Starting agent services...".into(),
            0.8,
        );
        self.run_stage(DeployStage::StartingServices, "systemctl daemon-reload")?;
        for service in self.artifacts.services.clone() {
            let unit = service.unit_name();
            self.run_stage(
                DeployStage::StartingServices,
                &format!("systemctl enable {}", unit),
            )?;
            // restart rather than start so a redeploy picks up new binaries
            self.run_stage(
                DeployStage::StartingServices,
                &format!("systemctl restart {}", unit),
            )?;
        }

        // 6. Verifying
        report(
            DeployStage::Verifying,
            "Verifying installation...".into(),
            0.9,
        );
        let after = self
            .check_installation()
            .map_err(|e| e.at(DeployStage::Verifying))?;
        if !after.is_installed {
            return Err(DeployError::Verification(format!(
                "install directory {} missing after deploy",
                layout.root
            )));
        }
        for (component, healthy) in &after.components {
            if !healthy {
                warn!(component = %component, "component not healthy after deploy");
            }
        }

        info!(
            version = after.version.as_deref().unwrap_or(UNKNOWN_VERSION),
            components = after.components.len(),
            "agent deployed"
        );
        Ok(after)
    }

    /// Redeploy while keeping the device's agent configuration.
    ///
    /// Backup and restore problems land in [`DeploymentStatus::warnings`];
    /// only the deploy itself can fail the update.
    pub fn update<F>(&mut self, on_progress: F) -> Result<DeploymentStatus, DeployError>
    where
        F: Fn(DeployProgress),
    {
        let mut warnings = Vec::new();
        let config_dir = self.layout.config_dir();

        let backed_up = match self.backup_config(&config_dir) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "config backup failed");
                warnings.push(format!("config backup failed: {e}"));
                false
            }
        };

        let deployed = self.deploy(on_progress);

        if backed_up {
            let restore = format!(
                "cp -a {}/. {}/",
                shell_quote(BACKUP_DIR),
                shell_quote(&config_dir)
            );
            if let Err(e) = self.shell.execute(&restore).and_then(|o| o.into_result()) {
                warn!(error = %e, "config restore failed");
                warnings.push(format!("config restore failed: {e}"));
            }
        }

        let mut status = deployed?;
        status.warnings.extend(warnings);
        Ok(status)
    }

    fn backup_config(&mut self, config_dir: &str) -> Result<(), RemoteError> {
        let backup = shell_quote(BACKUP_DIR);
        let cmd = format!(
            "rm -rf {backup} && mkdir -p {backup} && cp -a {}/. {backup}/",
            shell_quote(config_dir)
        );
        self.shell.execute(&cmd)?.into_result().map(|_| ())
    }

    /// Stop and remove the agent. Best effort: every step is attempted and
    /// failures are collected as warnings.
    pub fn uninstall<F>(&mut self, on_progress: F) -> Result<DeploymentStatus, DeployError>
    where
        F: Fn(DeployProgress),
    {
        let start = Instant::now();
        let report = |stage: DeployStage, message: String, fraction: f32| {
            on_progress(DeployProgress {
                stage,
                message,
                fraction,
                elapsed: start.elapsed(),
            })
        };
        if !self.shell.is_connected() {
            return Err(DeployError::Remote(RemoteError::NotConnected));
        }

        let mut warnings = Vec::new();
        let mut attempt = |shell: &mut S, cmd: String| {
            if let Err(e) = shell.execute(&cmd).and_then(|o| o.into_result()) {
                warn!(command = %cmd, error = %e, "uninstall step failed");
                warnings.push(format!("{cmd}: {e}"));
            }
        };

        report(DeployStage::Checking, "Stopping agent services...".into(), 0.1);
        for service in &self.artifacts.services {
            let unit = service.unit_name();
            attempt(self.shell, format!("systemctl stop {}", unit));
            attempt(self.shell, format!("systemctl disable {}", unit));
        }

        report(
            DeployStage::ConfiguringServices,
            "Removing unit files and agent files...".into(),
            0.5,
        );
        for service in &self.artifacts.services {
            attempt(
                self.shell,
                format!("rm -f {}", shell_quote(&self.layout.unit_path(service))),
            );
        }
        attempt(self.shell, format!("rm -rf {}", shell_quote(&self.layout.root)));
        attempt(self.shell, "systemctl daemon-reload".to_string());

        report(DeployStage::Verifying, "Checking removal...".into(), 0.9);
        let mut status = self.check_installation()?;
        status.warnings = warnings;

        report(
            DeployStage::Complete,
            if status.warnings.is_empty() {
                "Agent removed".into()
            } else {
                format!("Agent removed with {} warning(s)", status.warnings.len())
            },
            1.0,
        );
        Ok(status)
    }

    fn run_stage(&mut self, stage: DeployStage, command: &str) -> Result<String, DeployError> {
        self.shell
            .execute(command)
            .and_then(|o| o.into_result())
            .map_err(|source| DeployError::Stage { stage, source })
    }

    fn upload_stage(
        &mut self,
        stage: DeployStage,
        contents: &[u8],
        remote_path: &str,
        mode: i32,
    ) -> Result<(), DeployError> {
        self.shell
            .upload_bytes(contents, remote_path, mode)
            .map_err(|source| DeployError::Stage { stage, source })
    }

    /// `test <flag> <path>` on the device, answered through stdout so the
    /// exit status of `test` never reads as a failed command.
    fn remote_test(&mut self, flag: &str, path: &str) -> Result<bool, RemoteError> {
        let cmd = format!(
            "test {} {} && echo present || echo absent",
            flag,
            shell_quote(path)
        );
        let out = self.shell.execute_command(&cmd)?;
        Ok(out.trim() == "present")
    }
}

/// Parse `version.json`. `None` for anything that is not a manifest.
pub fn parse_manifest(raw: &str) -> Option<VersionManifest> {
    serde_json::from_str(raw.trim()).ok()
}

/// Render the systemd unit for one agent service.
pub fn render_unit(service: &AgentService, layout: &RemoteLayout) -> String {
    format!(
        "[Unit]\n\
         Description={description}\n\
         After=network.target\n\
         \n\
         [Service]\n\
         ExecStart={bin}/{binary} --config {config}\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        description = service.description,
        bin = layout.bin_dir(),
        binary = service.binary,
        config = layout.agent_config_path(),
    )
}
