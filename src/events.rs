//! Typed event queue for pipeline notifications.
//!
//! Producers publish [`SyncEvent`]s on an [`EventBus`]; anything interested
//! (the CLI progress printer, a future UI) registers with
//! [`EventBus::subscribe`] and drains its own receiver. Publishing with no
//! subscribers is not an error.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::deploy::DeployProgress;

const EVENT_CAPACITY: usize = 256;

/// Everything the pipeline announces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// The device session came up or went away.
    ConnectionChanged { host: String, connected: bool },
    /// The ingestion server accepted a page.
    PageReceived {
        document_id: String,
        page_id: String,
        notebook: String,
        section: String,
        page: String,
        size_bytes: u64,
    },
    /// A deployment stage advanced.
    Deploy(DeployProgress),
    /// The upload queue finished one record.
    QueueProgress {
        document_id: String,
        page_id: String,
        uploaded: bool,
        processed: usize,
        total: usize,
    },
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Register a new subscriber. It sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("event dropped: no subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
