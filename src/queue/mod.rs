//! Upload queue processor.
//!
//! Drains Pending pages from the store into the cloud notebook service, one
//! page at a time. Notebook and section get-or-create calls are not safe
//! against concurrent duplicates, so at most one pass runs per store in this
//! process; a second `run_pass` while one is active returns
//! [`PassOutcome::AlreadyRunning`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::{NotebookClient, PageMetadata, PageUpload, content_type_for};
use crate::events::{EventBus, SyncEvent};
use crate::model::types::{PageRecord, PageStatus};
use crate::storage::{SharedStore, StatusUpdate};

pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Stores with an active pass, keyed by database path.
static ACTIVE_STORES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Removes its store from [`ACTIVE_STORES`] on drop.
struct PassGuard {
    key: PathBuf,
}

impl PassGuard {
    fn acquire(key: PathBuf) -> Option<Self> {
        if ACTIVE_STORES.lock().insert(key.clone()) {
            Some(Self { key })
        } else {
            None
        }
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        ACTIVE_STORES.lock().remove(&self.key);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub attempted: usize,
    pub uploaded: usize,
    pub failed: usize,
    /// Re-received while uploading; left Pending for the next pass.
    pub superseded: usize,
    /// Stopped early on cancellation.
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    AlreadyRunning,
}

pub struct UploadQueueProcessor<C: NotebookClient> {
    store: SharedStore,
    client: C,
    batch_size: usize,
    events: EventBus,
}

impl<C: NotebookClient> UploadQueueProcessor<C> {
    pub fn new(store: SharedStore, client: C, events: EventBus) -> Self {
        Self {
            store,
            client,
            batch_size: DEFAULT_BATCH_SIZE,
            events,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Whether a pass is currently active against this processor's store.
    pub fn is_running(&self) -> bool {
        let key = self.store.lock().path().to_path_buf();
        ACTIVE_STORES.lock().contains(&key)
    }

    /// Upload one batch of Pending pages.
    ///
    /// Each page either reaches Uploaded or Failed, unless it was re-received
    /// mid-upload, in which case the new version stays Pending. A failure
    /// never stops the batch. `cancel` is checked before each page, never during one.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<PassOutcome> {
        let key = self.store.lock().path().to_path_buf();
        let Some(_guard) = PassGuard::acquire(key) else {
            debug!("upload pass already running; skipping");
            return Ok(PassOutcome::AlreadyRunning);
        };

        let batch = self
            .store
            .lock()
            .list_by_status(PageStatus::Pending, self.batch_size)
            .context("listing pending pages")?;
        let total = batch.len();
        if total == 0 {
            debug!("no pending pages");
            return Ok(PassOutcome::Completed(PassReport::default()));
        }
        info!(total, "upload pass started");

        let mut report = PassReport::default();
        let mut notebooks: HashMap<String, String> = HashMap::new();
        let mut sections: HashMap<(String, String), String> = HashMap::new();

        for page in batch {
            if cancel.is_cancelled() {
                info!(processed = report.attempted, total, "upload pass cancelled");
                report.cancelled = true;
                break;
            }
            report.attempted += 1;
            let key = page.key();

            self.store
                .lock()
                .update_status(&key, StatusUpdate::InProgress)
                .with_context(|| format!("marking {key} in progress"))?;

            let update = match self.upload_one(&page, &mut notebooks, &mut sections).await {
                Ok(cloud_page_id) => StatusUpdate::Uploaded { cloud_page_id },
                Err(e) => StatusUpdate::Failed {
                    error: format!("{e:#}"),
                },
            };
            let finished = self
                .store
                .lock()
                .finish_attempt(&key, &page.content_hash, update.clone())
                .with_context(|| format!("finishing upload of {key}"))?;

            let uploaded = match (finished, update) {
                (None, _) => {
                    info!(page = %key, "page re-received during upload; left for next pass");
                    report.superseded += 1;
                    false
                }
                (Some(_), StatusUpdate::Uploaded { cloud_page_id }) => {
                    info!(page = %key, cloud_page_id = %cloud_page_id, "page uploaded");
                    report.uploaded += 1;
                    true
                }
                (Some(record), _) => {
                    warn!(
                        page = %key,
                        retry_count = record.retry_count,
                        error = record.last_error.as_deref().unwrap_or_default(),
                        "page upload failed"
                    );
                    report.failed += 1;
                    false
                }
            };

            self.events.publish(SyncEvent::QueueProgress {
                document_id: page.document_id.clone(),
                page_id: page.page_id.clone(),
                uploaded,
                processed: report.attempted,
                total,
            });
        }

        info!(
            uploaded = report.uploaded,
            failed = report.failed,
            superseded = report.superseded,
            cancelled = report.cancelled,
            "upload pass finished"
        );
        Ok(PassOutcome::Completed(report))
    }

    async fn upload_one(
        &self,
        page: &PageRecord,
        notebooks: &mut HashMap<String, String>,
        sections: &mut HashMap<(String, String), String>,
    ) -> Result<String> {
        let notebook_id = match notebooks.get(&page.notebook) {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .client
                    .get_or_create_notebook(&page.notebook)
                    .await
                    .with_context(|| format!("resolving notebook {:?}", page.notebook))?;
                notebooks.insert(page.notebook.clone(), id.clone());
                id
            }
        };

        let section_key = (notebook_id.clone(), page.section.clone());
        let section_id = match sections.get(&section_key) {
            Some(id) => id.clone(),
            None => {
                let id = self
                    .client
                    .get_or_create_section(&notebook_id, &page.section)
                    .await
                    .with_context(|| format!("resolving section {:?}", page.section))?;
                sections.insert(section_key, id.clone());
                id
            }
        };

        let bytes = tokio::fs::read(&page.local_path)
            .await
            .with_context(|| format!("reading {}", page.local_path.display()))?;
        let filename = page
            .local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.bin", page.page_id));

        let upload = PageUpload {
            title: page.page_name.clone(),
            content_type: content_type_for(&filename).to_string(),
            filename,
            bytes,
            metadata: PageMetadata {
                virtual_path: page.virtual_path.clone(),
                document_id: page.document_id.clone(),
                page_number: page.page_number(),
                imported_at: chrono::Utc::now().to_rfc3339(),
            },
        };

        let cloud_page_id = self.client.upload_page(&section_id, &upload).await?;
        Ok(cloud_page_id)
    }

    /// Put every Failed page back in the queue. Returns how many moved.
    pub fn retry_failed(&self) -> Result<usize> {
        let reset = self.store.lock().reset_failed()?;
        info!(reset, "failed pages requeued");
        Ok(reset)
    }
}
