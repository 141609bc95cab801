//! Device presence handling and the automatic sync loop.
//!
//! Presence detection is external: whatever notices the tablet coming and
//! going feeds [`DeviceEvent`]s into [`DeviceLink::run`]. The link owns the
//! shared session slot and announces every change on the event bus.
//!
//! [`run_sync_loop`] drives the upload queue on a fixed interval until
//! cancelled. A failed cycle is logged and the loop carries on.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cloud::NotebookClient;
use crate::events::{EventBus, SyncEvent};
use crate::queue::{PassOutcome, UploadQueueProcessor};
use crate::remote::session::RemoteSession;
use crate::remote::{DeviceTarget, LIVENESS_TIMEOUT, RemoteError, RemoteShell, SharedSession};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Presence notifications from an external detector.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected(DeviceTarget),
    Disconnected { host: String },
}

/// Holds the device session and keeps it in step with presence events.
#[derive(Clone)]
pub struct DeviceLink {
    session: SharedSession,
    events: EventBus,
}

impl DeviceLink {
    pub fn new(events: EventBus) -> Self {
        Self {
            session: Arc::new(parking_lot::Mutex::new(None)),
            events,
        }
    }

    /// Slot shared with the orchestrator; lock it for the length of one
    /// operation so commands never interleave.
    pub fn session(&self) -> SharedSession {
        Arc::clone(&self.session)
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// Apply one presence event.
    pub async fn handle(&self, event: DeviceEvent) -> Result<(), RemoteError> {
        match event {
            DeviceEvent::Connected(target) => self.connect(target).await,
            DeviceEvent::Disconnected { host } => {
                self.disconnect(&host);
                Ok(())
            }
        }
    }

    async fn connect(&self, target: DeviceTarget) -> Result<(), RemoteError> {
        if self.is_connected() {
            debug!(host = %target.host, "device already connected");
            return Ok(());
        }

        let host = target.host.clone();
        let port = target.port;
        let reachable = tokio::task::spawn_blocking(move || {
            crate::remote::session::probe_device(&host, port, LIVENESS_TIMEOUT)
        })
        .await
        .unwrap_or(false);
        if !reachable {
            return Err(RemoteError::Connection {
                host: target.host,
                reason: "device did not answer liveness probe".into(),
            });
        }

        let host = target.host.clone();
        let session = tokio::task::spawn_blocking(move || RemoteSession::connect(&target))
            .await
            .map_err(|e| RemoteError::Connection {
                host: host.clone(),
                reason: format!("connect task failed: {e}"),
            })??;

        if let Some(mut old) = self.session.lock().replace(session) {
            old.disconnect();
        }
        info!(host = %host, "device link up");
        self.events.publish(SyncEvent::ConnectionChanged {
            host,
            connected: true,
        });
        Ok(())
    }

    fn disconnect(&self, host: &str) {
        let previous = self.session.lock().take();
        if let Some(mut session) = previous {
            session.disconnect();
        }
        info!(host = %host, "device link down");
        self.events.publish(SyncEvent::ConnectionChanged {
            host: host.to_string(),
            connected: false,
        });
    }

    /// Consume presence events until the channel closes or `cancel` fires.
    /// Connect failures are logged; the next event gets a fresh attempt.
    pub async fn run(self, mut events: mpsc::Receiver<DeviceEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = events.recv() => {
                    let Some(event) = next else { break };
                    if let Err(e) = self.handle(event).await {
                        warn!(error = %e, "device event failed");
                    }
                }
            }
        }
        if let Some(mut session) = self.session.lock().take() {
            session.disconnect();
        }
        debug!("device link stopped");
    }
}

/// One queue pass, with every error folded into a log line.
pub async fn sync_cycle<C: NotebookClient>(
    processor: &UploadQueueProcessor<C>,
    cancel: &CancellationToken,
) -> Option<PassOutcome> {
    match processor.run_pass(cancel).await {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            error!(error = %format!("{e:#}"), "sync cycle failed");
            None
        }
    }
}

/// Run [`sync_cycle`] immediately and then every `interval` until `cancel`.
/// An in-flight page always finishes before the loop exits.
pub async fn run_sync_loop<C: NotebookClient>(
    processor: Arc<UploadQueueProcessor<C>>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<usize> {
    let mut cycles = 0usize;
    info!(interval_secs = interval.as_secs(), "automatic sync started");
    loop {
        if cancel.is_cancelled() {
            break;
        }
        sync_cycle(&*processor, &cancel).await;
        cycles += 1;

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
    info!(cycles, "automatic sync stopped");
    Ok(cycles)
}

/// Spawn the device link on its own task, returning the sender for events.
pub fn spawn_device_link(
    link: DeviceLink,
    cancel: CancellationToken,
) -> (mpsc::Sender<DeviceEvent>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(link.run(rx, cancel));
    (tx, handle)
}

/// Connect once for a one-shot CLI command.
pub async fn connect_once(target: DeviceTarget) -> Result<RemoteSession> {
    let host = target.host.clone();
    tokio::task::spawn_blocking(move || RemoteSession::connect(&target))
        .await
        .context("connect task panicked")?
        .with_context(|| format!("connecting to {host}"))
}
