//! Page and document records tracked through the sync pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a page is in its trip to the cloud.
///
/// Per attempt the path is `Pending -> InProgress -> {Uploaded | Failed}`.
/// The queue persists `InProgress` while it holds a page; pages a crash left
/// there are requeued when the server starts. `Failed -> Pending` is the
/// manual retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    InProgress,
    Uploaded,
    Failed,
    Skipped,
    Deleted,
}

impl PageStatus {
    pub const ALL: [PageStatus; 6] = [
        PageStatus::Pending,
        PageStatus::InProgress,
        PageStatus::Uploaded,
        PageStatus::Failed,
        PageStatus::Skipped,
        PageStatus::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Uploaded => "uploaded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "uploaded" => Some(Self::Uploaded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Allowed status changes on an existing record.
    pub fn can_transition_to(self, next: PageStatus) -> bool {
        use PageStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress | Skipped | Deleted)
                | (InProgress, Uploaded | Failed)
                | (Failed, Pending | Skipped | Deleted)
                | (Skipped, Pending | Deleted)
                | (Uploaded, Deleted)
        )
    }
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique identity of a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub document_id: String,
    pub page_id: String,
}

impl PageKey {
    pub fn new(document_id: impl Into<String>, page_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            page_id: page_id.into(),
        }
    }
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.document_id, self.page_id)
    }
}

/// One page file received from the device. Timestamps are unix millis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRecord {
    pub document_id: String,
    pub page_id: String,
    /// On-device folder/page path, e.g. `Physics/Ch1/Page 3`.
    pub virtual_path: String,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// SHA-256 of the file, hex.
    pub content_hash: String,
    pub notebook: String,
    pub section: String,
    pub page_name: String,
    pub status: PageStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub cloud_page_id: Option<String>,
    pub last_sync_time: Option<i64>,
    pub created_at: i64,
    pub last_modified: i64,
}

impl PageRecord {
    pub fn key(&self) -> PageKey {
        PageKey::new(&self.document_id, &self.page_id)
    }

    /// Trailing number of the page id (`page12` -> 12), if any.
    pub fn page_number(&self) -> Option<u32> {
        let digits: String = self
            .page_id
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        digits.parse().ok()
    }
}

/// A notebook on the device; groups its pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub visible_name: String,
    pub parent: Option<String>,
    pub last_modified: i64,
}
