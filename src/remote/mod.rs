//! Remote session channel to the tablet.
//!
//! The device exposes its administrative account over SSH. Two sub-channels
//! ride on one authenticated session:
//!
//! - **command**: `exec` channels for shell commands, stdout captured
//! - **transfer**: an SFTP handle for single-file uploads and downloads
//!
//! [`RemoteShell`] is the seam the deployment orchestrator and the sync layer
//! program against. [`session::RemoteSession`] is the ssh2-backed
//! implementation; tests drive the orchestrator with an in-memory device.
//!
//! Every method that talks to the device takes `&mut self`, so a session can
//! never run two commands at once. Code that shares a session across tasks
//! goes through [`SharedSession`].

pub mod session;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use session::{RemoteSession, probe_device};

/// Timeout for TCP connect, SSH handshake and authentication.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single remote command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the cheap "is the device still there" probe.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

/// A session slot shared between the orchestrator and the sync layer.
///
/// `None` while the device is disconnected.
pub type SharedSession = Arc<parking_lot::Mutex<Option<RemoteSession>>>;

/// Errors raised by the remote channel.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    #[error("Remote command exited with status {exit_code}: {stderr}")]
    Command { exit_code: i32, stderr: String },

    #[error("Transfer of {path} failed: {reason}")]
    Transfer { path: String, reason: String },

    #[error("Session is not connected")]
    NotConnected,

    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How to authenticate against the device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    Password {
        password: String,
    },
    KeyFile {
        path: std::path::PathBuf,
        passphrase: Option<String>,
    },
}

/// Address and login for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl DeviceTarget {
    /// `host:port` for socket calls and log fields.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Promote a non-zero exit into a [`RemoteError::Command`].
    pub fn into_result(self) -> Result<String, RemoteError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(RemoteError::Command {
                exit_code: self.exit_code,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Command and file-transfer operations against a connected device.
pub trait RemoteShell {
    /// Run `command` and capture stdout, stderr and the exit status.
    fn execute(&mut self, command: &str) -> Result<CommandOutput, RemoteError>;

    /// Write `contents` to `remote_path` with permission bits `mode`,
    /// creating missing parent directories first. Existing files are
    /// overwritten.
    fn upload_bytes(
        &mut self,
        contents: &[u8],
        remote_path: &str,
        mode: i32,
    ) -> Result<(), RemoteError>;

    /// Copy `remote_path` to `local_path`, returning the byte count.
    fn download_file(&mut self, remote_path: &str, local_path: &Path)
    -> Result<u64, RemoteError>;

    /// Live connection state.
    fn is_connected(&self) -> bool;

    /// Run `command` and return its stdout.
    ///
    /// A non-zero exit with something on stderr is logged, not raised; the
    /// caller decides whether the output means failure.
    fn execute_command(&mut self, command: &str) -> Result<String, RemoteError> {
        let output = self.execute(command)?;
        if !output.success() && !output.stderr.trim().is_empty() {
            tracing::warn!(
                command = %command,
                exit_code = output.exit_code,
                stderr = %output.stderr.trim(),
                "remote command failed"
            );
        }
        Ok(output.stdout)
    }

    /// Upload a local file.
    fn upload_file(
        &mut self,
        local_path: &Path,
        remote_path: &str,
        mode: i32,
    ) -> Result<(), RemoteError> {
        let contents = std::fs::read(local_path)?;
        self.upload_bytes(&contents, remote_path, mode)
    }
}

/// Quote a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | ':' | '='))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parent directories of an absolute remote path, shallowest first.
///
/// `/a/b/c.txt` yields `["/a", "/a/b"]`.
pub fn parent_dirs(remote_path: &str) -> Vec<String> {
    let components: Vec<&str> = remote_path.split('/').filter(|c| !c.is_empty()).collect();
    let absolute = remote_path.starts_with('/');
    let mut dirs = Vec::new();
    let mut current = String::new();
    for component in components.iter().take(components.len().saturating_sub(1)) {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(component);
        dirs.push(current.clone());
    }
    dirs
}
