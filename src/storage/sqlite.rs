//! `SQLite` backend: schema, pragmas, migrations and typed row decoding.

use crate::model::types::{DocumentRecord, PageKey, PageRecord, PageStatus};
use anyhow::{Context, Result, anyhow, bail};
use rusqlite::{Connection, OptionalExtension, Row, named_params, params};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

const SCHEMA_VERSION: i64 = 2;

/// Distinguishes in-memory stores from one another.
static MEMORY_STORES: AtomicUsize = AtomicUsize::new(0);

const MIGRATION_V1: &str = r"
CREATE TABLE IF NOT EXISTS documents (
    document_id TEXT PRIMARY KEY,
    visible_name TEXT NOT NULL,
    parent TEXT,
    last_modified INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pages (
    document_id TEXT NOT NULL,
    page_id TEXT NOT NULL,
    virtual_path TEXT NOT NULL,
    local_path TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    notebook TEXT NOT NULL,
    section TEXT NOT NULL,
    page_name TEXT NOT NULL,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    cloud_page_id TEXT,
    last_sync_time INTEGER,
    created_at INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    PRIMARY KEY (document_id, page_id)
);
";

const MIGRATION_V2: &str = r"
-- Queue scans pull pending pages newest first
CREATE INDEX IF NOT EXISTS idx_pages_status_modified
    ON pages(status, last_modified DESC);
";

const PAGE_COLUMNS: &str = "document_id, page_id, virtual_path, local_path, size_bytes, \
     content_hash, notebook, section, page_name, status, retry_count, last_error, \
     cloud_page_id, last_sync_time, created_at, last_modified";

/// A status change requested by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Manual retry of a failed page.
    Pending,
    InProgress,
    Uploaded { cloud_page_id: String },
    Failed { error: String },
    Skipped,
    Deleted,
}

impl StatusUpdate {
    pub fn status(&self) -> PageStatus {
        match self {
            Self::Pending => PageStatus::Pending,
            Self::InProgress => PageStatus::InProgress,
            Self::Uploaded { .. } => PageStatus::Uploaded,
            Self::Failed { .. } => PageStatus::Failed,
            Self::Skipped => PageStatus::Skipped,
            Self::Deleted => PageStatus::Deleted,
        }
    }
}

/// Page counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub uploaded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub deleted: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.uploaded + self.failed + self.skipped + self.deleted
    }

    fn slot(&mut self, status: PageStatus) -> &mut u64 {
        match status {
            PageStatus::Pending => &mut self.pending,
            PageStatus::InProgress => &mut self.in_progress,
            PageStatus::Uploaded => &mut self.uploaded,
            PageStatus::Failed => &mut self.failed,
            PageStatus::Skipped => &mut self.skipped,
            PageStatus::Deleted => &mut self.deleted,
        }
    }
}

/// Outcome of an age-based cache cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub records_removed: usize,
    pub files_deleted: usize,
}

pub struct PageStore {
    conn: Connection,
    path: PathBuf,
}

impl PageStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating db directory {}", parent.display()))?;
        }

        let mut conn = Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path.display()))?;

        apply_pragmas(&conn)?;
        init_meta(&conn)?;
        migrate(&mut conn)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Throwaway store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory().context("opening in-memory sqlite db")?;
        init_meta(&conn)?;
        migrate(&mut conn)?;
        Ok(Self {
            conn,
            path: PathBuf::from(format!(
                ":memory:{}",
                MEMORY_STORES.fetch_add(1, Ordering::Relaxed)
            )),
        })
    }

    /// Database file path; identifies the store for the queue's run guard.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT value FROM meta WHERE key='schema_version'",
                [],
                |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
            )
            .optional()?
            .ok_or_else(|| anyhow!("schema_version missing"))
    }

    // -------------------------------------------------------------------------
    // Pages
    // -------------------------------------------------------------------------

    /// Insert or replace a page.
    ///
    /// Re-receiving a page replaces its file and destination fields and
    /// returns it to the given status; `retry_count` keeps its history.
    pub fn save_page(&self, page: &PageRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO pages(document_id, page_id, virtual_path, local_path, size_bytes,
                    content_hash, notebook, section, page_name, status, retry_count, last_error,
                    cloud_page_id, last_sync_time, created_at, last_modified)
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(document_id, page_id) DO UPDATE SET
                    virtual_path = excluded.virtual_path,
                    local_path = excluded.local_path,
                    size_bytes = excluded.size_bytes,
                    content_hash = excluded.content_hash,
                    notebook = excluded.notebook,
                    section = excluded.section,
                    page_name = excluded.page_name,
                    status = excluded.status,
                    last_error = excluded.last_error,
                    cloud_page_id = excluded.cloud_page_id,
                    last_sync_time = excluded.last_sync_time,
                    last_modified = excluded.last_modified",
                params![
                    page.document_id,
                    page.page_id,
                    page.virtual_path,
                    page.local_path.to_string_lossy(),
                    page.size_bytes as i64,
                    page.content_hash,
                    page.notebook,
                    page.section,
                    page.page_name,
                    page.status.as_str(),
                    page.retry_count,
                    page.last_error,
                    page.cloud_page_id,
                    page.last_sync_time,
                    page.created_at,
                    page.last_modified,
                ],
            )
            .with_context(|| format!("saving page {}", page.key()))?;
        Ok(())
    }

    pub fn get_page(&self, key: &PageKey) -> Result<Option<PageRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {PAGE_COLUMNS} FROM pages WHERE document_id = ?1 AND page_id = ?2"
                ),
                params![key.document_id, key.page_id],
                page_from_row,
            )
            .optional()
            .with_context(|| format!("fetching page {key}"))
    }

    /// Pages in `status`, most recently modified first.
    pub fn list_by_status(&self, status: PageStatus, limit: usize) -> Result<Vec<PageRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {PAGE_COLUMNS} FROM pages WHERE status = ?1
             ORDER BY last_modified DESC, created_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], page_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Apply a status change, rejecting transitions the lifecycle forbids.
    ///
    /// `Failed` bumps `retry_count` and records the error; `Uploaded` sets
    /// `cloud_page_id` and clears the error. Returns the updated record.
    pub fn update_status(&self, key: &PageKey, update: StatusUpdate) -> Result<PageRecord> {
        let current = self
            .get_page(key)?
            .ok_or_else(|| anyhow!("page {key} not found"))?;
        let next = update.status();
        if !current.status.can_transition_to(next) {
            bail!(
                "page {key}: illegal status transition {} -> {}",
                current.status,
                next
            );
        }

        if self.apply_update(key, &update, current.status, None)? == 0 {
            bail!("page {key} changed status concurrently");
        }
        debug!(page = %key, from = %current.status, to = %next, "page status updated");

        self.get_page(key)?
            .ok_or_else(|| anyhow!("page {key} vanished after update"))
    }

    /// Close an upload attempt on a page the queue marked in progress.
    ///
    /// Applies only while the row is still in progress with `content_hash`.
    /// A page re-received mid-upload keeps what the ingestion server saved
    /// and `None` is returned.
    pub fn finish_attempt(
        &self,
        key: &PageKey,
        content_hash: &str,
        update: StatusUpdate,
    ) -> Result<Option<PageRecord>> {
        if !matches!(
            update,
            StatusUpdate::Uploaded { .. } | StatusUpdate::Failed { .. }
        ) {
            bail!("page {key}: an upload attempt cannot end in {}", update.status());
        }

        if self.apply_update(key, &update, PageStatus::InProgress, Some(content_hash))? == 0 {
            let current = self
                .get_page(key)?
                .ok_or_else(|| anyhow!("page {key} not found"))?;
            debug!(page = %key, status = %current.status, "upload attempt superseded");
            return Ok(None);
        }
        debug!(page = %key, to = %update.status(), "upload attempt finished");

        self.get_page(key)?
            .ok_or_else(|| anyhow!("page {key} vanished after update"))
            .map(Some)
    }

    /// Write `update` if the row is still in `from` (and, when given, still
    /// holds `content_hash`). Returns the number of rows changed.
    fn apply_update(
        &self,
        key: &PageKey,
        update: &StatusUpdate,
        from: PageStatus,
        content_hash: Option<&str>,
    ) -> Result<usize> {
        let next = update.status();
        let now = Self::now_millis();
        let guard = "document_id = :document_id AND page_id = :page_id AND status = :from
             AND (:content_hash IS NULL OR content_hash = :content_hash)";
        let rows = match update {
            StatusUpdate::Uploaded { cloud_page_id } => self.conn.execute(
                &format!(
                    "UPDATE pages SET status = :next, cloud_page_id = :cloud_page_id,
                        last_error = NULL, last_sync_time = :now
                     WHERE {guard}"
                ),
                named_params! {
                    ":next": next.as_str(),
                    ":cloud_page_id": cloud_page_id,
                    ":now": now,
                    ":document_id": key.document_id,
                    ":page_id": key.page_id,
                    ":from": from.as_str(),
                    ":content_hash": content_hash,
                },
            ),
            StatusUpdate::Failed { error } => self.conn.execute(
                &format!(
                    "UPDATE pages SET status = :next, last_error = :error,
                        retry_count = retry_count + 1, last_sync_time = :now
                     WHERE {guard}"
                ),
                named_params! {
                    ":next": next.as_str(),
                    ":error": error,
                    ":now": now,
                    ":document_id": key.document_id,
                    ":page_id": key.page_id,
                    ":from": from.as_str(),
                    ":content_hash": content_hash,
                },
            ),
            _ => self.conn.execute(
                &format!("UPDATE pages SET status = :next WHERE {guard}"),
                named_params! {
                    ":next": next.as_str(),
                    ":document_id": key.document_id,
                    ":page_id": key.page_id,
                    ":from": from.as_str(),
                    ":content_hash": content_hash,
                },
            ),
        }
        .with_context(|| format!("updating status of page {key}"))?;
        Ok(rows)
    }

    pub fn mark_uploaded(&self, key: &PageKey, cloud_page_id: &str) -> Result<PageRecord> {
        self.update_status(
            key,
            StatusUpdate::Uploaded {
                cloud_page_id: cloud_page_id.to_string(),
            },
        )
    }

    pub fn mark_failed(&self, key: &PageKey, error: &str) -> Result<PageRecord> {
        self.update_status(
            key,
            StatusUpdate::Failed {
                error: error.to_string(),
            },
        )
    }

    /// Return every failed page to pending. `retry_count` and `last_error`
    /// are left as history.
    pub fn reset_failed(&self) -> Result<usize> {
        let rows = self
            .conn
            .execute(
                "UPDATE pages SET status = ?1 WHERE status = ?2",
                params![PageStatus::Pending.as_str(), PageStatus::Failed.as_str()],
            )
            .context("resetting failed pages")?;
        info!(count = rows, "failed pages reset to pending");
        Ok(rows)
    }

    /// Return pages left InProgress by an interrupted pass to Pending.
    pub fn requeue_interrupted(&self) -> Result<usize> {
        let rows = self
            .conn
            .execute(
                "UPDATE pages SET status = ?1 WHERE status = ?2",
                params![PageStatus::Pending.as_str(), PageStatus::InProgress.as_str()],
            )
            .context("requeueing interrupted pages")?;
        if rows > 0 {
            warn!(count = rows, "requeued pages left in progress");
        }
        Ok(rows)
    }

    pub fn status_counts(&self) -> Result<StatusCounts> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM pages GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = StatusCounts::default();
        for r in rows {
            let (status, count) = r?;
            match PageStatus::parse(&status) {
                Some(s) => *counts.slot(s) += count as u64,
                None => warn!(status = %status, "unknown status in pages table"),
            }
        }
        Ok(counts)
    }

    /// Drop finished pages (uploaded, skipped, deleted) not modified within
    /// `max_age`, along with their local files.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<CleanupReport> {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Self::now_millis().saturating_sub(max_age_ms);
        let finished = [
            PageStatus::Uploaded.as_str(),
            PageStatus::Skipped.as_str(),
            PageStatus::Deleted.as_str(),
        ];

        let mut stmt = self.conn.prepare(
            "SELECT document_id, page_id, local_path FROM pages
             WHERE last_modified < ?1 AND status IN (?2, ?3, ?4)",
        )?;
        let stale: Vec<(String, String, String)> = stmt
            .query_map(
                params![cutoff, finished[0], finished[1], finished[2]],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?
            .collect::<rusqlite::Result<_>>()?;

        let mut report = CleanupReport::default();
        for (document_id, page_id, local_path) in stale {
            let path = Path::new(&local_path);
            if path.exists() {
                match fs::remove_file(path) {
                    Ok(()) => report.files_deleted += 1,
                    Err(e) => {
                        warn!(path = %local_path, error = %e, "failed to delete cached page file")
                    }
                }
            }
            report.records_removed += self.conn.execute(
                "DELETE FROM pages WHERE document_id = ?1 AND page_id = ?2",
                params![document_id, page_id],
            )?;
        }

        info!(
            removed = report.records_removed,
            files = report.files_deleted,
            "cache cleanup finished"
        );
        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Documents
    // -------------------------------------------------------------------------

    pub fn upsert_document(&self, doc: &DocumentRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO documents(document_id, visible_name, parent, last_modified)
             VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(document_id) DO UPDATE SET
                visible_name = excluded.visible_name,
                parent = excluded.parent,
                last_modified = excluded.last_modified",
            params![
                doc.document_id,
                doc.visible_name,
                doc.parent,
                doc.last_modified
            ],
        )?;
        Ok(())
    }

    pub fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        self.conn
            .query_row(
                "SELECT document_id, visible_name, parent, last_modified
                 FROM documents WHERE document_id = ?1",
                params![document_id],
                |row| {
                    Ok(DocumentRecord {
                        document_id: row.get(0)?,
                        visible_name: row.get(1)?,
                        parent: row.get(2)?,
                        last_modified: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("fetching document '{document_id}'"))
    }

    pub fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

fn page_from_row(row: &Row<'_>) -> rusqlite::Result<PageRecord> {
    let status_str: String = row.get(9)?;
    let status = PageStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            9,
            rusqlite::types::Type::Text,
            format!("unknown page status '{status_str}'").into(),
        )
    })?;
    let local_path: String = row.get(3)?;
    Ok(PageRecord {
        document_id: row.get(0)?,
        page_id: row.get(1)?,
        virtual_path: row.get(2)?,
        local_path: PathBuf::from(local_path),
        size_bytes: row.get::<_, i64>(4)? as u64,
        content_hash: row.get(5)?,
        notebook: row.get(6)?,
        section: row.get(7)?,
        page_name: row.get(8)?,
        status,
        retry_count: row.get(10)?,
        last_error: row.get(11)?,
        cloud_page_id: row.get(12)?,
        last_sync_time: row.get(13)?,
        created_at: row.get(14)?,
        last_modified: row.get(15)?,
    })
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        ",
    )?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

fn init_meta(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        [],
    )?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?;

    if existing.is_none() {
        // Start at version 0 so migrate() applies full schema on first open.
        conn.execute(
            "INSERT INTO meta(key, value) VALUES('schema_version', '0')",
            [],
        )?;
    }

    Ok(())
}

fn migrate(conn: &mut Connection) -> Result<()> {
    let current: i64 = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0).map(|s| s.parse().unwrap_or(0)),
        )
        .optional()?
        .unwrap_or(0);

    if current == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;

    match current {
        0 => {
            tx.execute_batch(MIGRATION_V1)?;
            tx.execute_batch(MIGRATION_V2)?;
        }
        1 => {
            tx.execute_batch(MIGRATION_V2)?;
        }
        v => return Err(anyhow!("unsupported schema version {v}")),
    }

    tx.execute(
        "UPDATE meta SET value = ? WHERE key = 'schema_version'",
        params![SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()?;
    info!(from = current, to = SCHEMA_VERSION, "page store migrated");
    Ok(())
}
