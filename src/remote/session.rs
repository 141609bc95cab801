//! ssh2-backed [`RemoteShell`].

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};

use ssh2::{FileStat, OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, info, warn};

use super::{
    COMMAND_TIMEOUT, CONNECT_TIMEOUT, CommandOutput, Credential, DeviceTarget, RemoteError,
    RemoteShell, parent_dirs,
};

/// An authenticated SSH session with its SFTP sub-channel.
///
/// Both handles are `Option` so [`RemoteSession::disconnect`] can release
/// them independently and be called any number of times.
pub struct RemoteSession {
    host: String,
    session: Option<Session>,
    sftp: Option<Sftp>,
    /// Clone of the socket handed to libssh2, kept for liveness checks.
    socket: Option<TcpStream>,
    command_timeout: Duration,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("host", &self.host)
            .field("session", &self.session.is_some())
            .field("sftp", &self.sftp.is_some())
            .finish()
    }
}

impl RemoteSession {
    /// Open the command and transfer sub-channels.
    ///
    /// Nothing is kept if any step fails; the caller gets
    /// [`RemoteError::Connection`] and no half-open session.
    pub fn connect(target: &DeviceTarget) -> Result<Self, RemoteError> {
        let start = Instant::now();
        let conn_err = |reason: String| RemoteError::Connection {
            host: target.host.clone(),
            reason,
        };

        let addr = target
            .address()
            .to_socket_addrs()
            .map_err(|e| conn_err(format!("cannot resolve address: {e}")))?
            .next()
            .ok_or_else(|| conn_err("address resolved to nothing".into()))?;

        let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|e| conn_err(e.to_string()))?;
        tcp.set_read_timeout(Some(CONNECT_TIMEOUT))
            .map_err(|e| conn_err(e.to_string()))?;
        let socket = tcp.try_clone().map_err(|e| conn_err(e.to_string()))?;

        let mut session = Session::new().map_err(|e| conn_err(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
        session
            .handshake()
            .map_err(|e| conn_err(format!("handshake failed: {e}")))?;

        match &target.credential {
            Credential::Password { password } => {
                session.userauth_password(&target.username, password)
            }
            Credential::KeyFile { path, passphrase } => session.userauth_pubkey_file(
                &target.username,
                None,
                path,
                passphrase.as_deref(),
            ),
        }
        .map_err(|e| conn_err(format!("authentication failed: {e}")))?;

        if !session.authenticated() {
            return Err(conn_err("authentication rejected".into()));
        }

        let sftp = session
            .sftp()
            .map_err(|e| conn_err(format!("sftp subsystem unavailable: {e}")))?;

        session.set_timeout(COMMAND_TIMEOUT.as_millis() as u32);
        info!(
            host = %target.host,
            port = target.port,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "connected to device"
        );

        Ok(Self {
            host: target.host.clone(),
            session: Some(session),
            sftp: Some(sftp),
            socket: Some(socket),
            command_timeout: COMMAND_TIMEOUT,
        })
    }

    /// Override the per-command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        if let Some(session) = &self.session {
            session.set_timeout(timeout.as_millis() as u32);
        }
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Release both sub-channels. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        // The SFTP handle must go before the session that owns it.
        if self.sftp.take().is_some() {
            debug!(host = %self.host, "closed sftp channel");
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = session.disconnect(None, "inkbridge disconnect", None) {
                debug!(host = %self.host, error = %e, "ssh disconnect reported an error");
            }
            info!(host = %self.host, "disconnected from device");
        }
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }

    fn session(&self) -> Result<&Session, RemoteError> {
        self.session.as_ref().ok_or(RemoteError::NotConnected)
    }

    fn sftp(&self) -> Result<&Sftp, RemoteError> {
        self.sftp.as_ref().ok_or(RemoteError::NotConnected)
    }

    /// Create every missing parent directory of `remote_path`.
    fn ensure_remote_parents(&self, remote_path: &str) -> Result<(), RemoteError> {
        let sftp = self.sftp()?;
        for dir in parent_dirs(remote_path) {
            let path = Path::new(&dir);
            if sftp.stat(path).is_ok() {
                continue;
            }
            debug!(host = %self.host, dir = %dir, "creating remote directory");
            sftp.mkdir(path, 0o755).map_err(|e| RemoteError::Transfer {
                path: dir.clone(),
                reason: format!("mkdir failed: {e}"),
            })?;
        }
        Ok(())
    }
}

impl RemoteShell for RemoteSession {
    fn execute(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let session = self.session()?;
        let start = Instant::now();

        let mut channel = session.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;

        debug!(
            host = %self.host,
            exit_code,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "remote command finished"
        );

        Ok(CommandOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    fn upload_bytes(
        &mut self,
        contents: &[u8],
        remote_path: &str,
        mode: i32,
    ) -> Result<(), RemoteError> {
        self.ensure_remote_parents(remote_path)?;
        let sftp = self.sftp()?;
        let path = Path::new(remote_path);
        let transfer_err = |reason: String| RemoteError::Transfer {
            path: remote_path.to_string(),
            reason,
        };

        let mut file = sftp
            .open_mode(
                path,
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                mode,
                OpenType::File,
            )
            .map_err(|e| transfer_err(e.to_string()))?;
        file.write_all(contents)
            .map_err(|e| transfer_err(e.to_string()))?;
        drop(file);

        // open_mode only applies `mode` to newly created files.
        sftp.setstat(
            path,
            FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode as u32),
                atime: None,
                mtime: None,
            },
        )
        .map_err(|e| transfer_err(format!("chmod failed: {e}")))?;

        debug!(
            host = %self.host,
            remote_path = %remote_path,
            bytes = contents.len(),
            "uploaded file"
        );
        Ok(())
    }

    fn download_file(
        &mut self,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<u64, RemoteError> {
        let sftp = self.sftp()?;
        let mut remote = sftp
            .open(Path::new(remote_path))
            .map_err(|e| RemoteError::Transfer {
                path: remote_path.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut local = std::fs::File::create(local_path)?;
        let bytes = std::io::copy(&mut remote, &mut local)?;
        local.flush()?;
        Ok(bytes)
    }

    fn is_connected(&self) -> bool {
        let (Some(session), Some(socket)) = (&self.session, &self.socket) else {
            return false;
        };
        if !session.authenticated() {
            return false;
        }
        socket_alive(socket)
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Peek the socket without consuming anything.
///
/// A zero-length read means the peer closed; `WouldBlock` means the socket is
/// idle but open.
fn socket_alive(socket: &TcpStream) -> bool {
    if !matches!(socket.take_error(), Ok(None)) || socket.peer_addr().is_err() {
        return false;
    }
    if socket.set_nonblocking(true).is_err() {
        return false;
    }
    let mut buf = [0u8; 1];
    let alive = match socket.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    if socket.set_nonblocking(false).is_err() {
        warn!("failed to restore blocking mode on device socket");
        return false;
    }
    alive
}

/// Cheap reachability probe: can we open a TCP connection within `timeout`?
pub fn probe_device(host: &str, port: u16, timeout: Duration) -> bool {
    let Ok(mut addrs) = (host, port).to_socket_addrs() else {
        return false;
    };
    addrs.any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}
