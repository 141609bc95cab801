//! Local HTTP ingestion server.
//!
//! The device agent pushes every new page here. Routes:
//!
//! - `GET  /health` - liveness and the upload root
//! - `GET  /config?device_id=ID` - agent configuration for one device
//! - `POST /upload` - one page file; headers `X-API-Key`, `X-Filename`
//!   (`{documentId}/{pageId}.ext`) and `X-Document-Path` (virtual path)
//!
//! axum runs each connection on its own task, so uploads are not serialized.
//! Rejected requests still have their body drained before the response goes
//! out.

pub mod virtual_path;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    body::Body,
    extract::{Query, Request, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, SyncEvent};
use crate::model::types::{DocumentRecord, PageRecord, PageStatus};
use crate::storage::{PageStore, SharedStore};
use virtual_path::{decompose, document_parts};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const FILENAME_HEADER: &str = "x-filename";
pub const DOCUMENT_PATH_HEADER: &str = "x-document-path";

/// Prefix every agent API key carries.
pub const DEFAULT_API_KEY_PREFIX: &str = "ink_";

pub const DEFAULT_PORT: u16 = 8080;

// =============================================================================
// Errors
// =============================================================================

/// Request failures, each mapped to its HTTP status.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid or missing API key")]
    InvalidApiKey,

    #[error("Method {0} not allowed")]
    MethodNotAllowed(Method),

    #[error("Malformed header {header}: {reason}")]
    MalformedHeader {
        header: &'static str,
        reason: String,
    },

    #[error("Missing device_id query parameter")]
    MissingDeviceId,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            IngestError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            IngestError::MalformedHeader { .. } | IngestError::MissingDeviceId => {
                StatusCode::BAD_REQUEST
            }
            IngestError::NotFound(_) => StatusCode::NOT_FOUND,
            IngestError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        IngestError::Internal(e.to_string())
    }
}

impl From<anyhow::Error> for IngestError {
    fn from(e: anyhow::Error) -> Self {
        IngestError::Internal(format!("{e:#}"))
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "upload processing failed");
        }
        (
            status,
            Json(json!({ "status": "error", "message": self.to_string() })),
        )
            .into_response()
    }
}

// =============================================================================
// Device configuration
// =============================================================================

/// Source of per-device agent configuration served on `/config`.
pub trait DeviceConfigProvider: Send + Sync {
    fn device_config(&self, device_id: &str) -> anyhow::Result<Value>;
}

/// Same settings for every device, stamped with its id.
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    pub server_url: String,
    pub sync_interval_secs: u64,
}

impl DeviceConfigProvider for StaticConfigProvider {
    fn device_config(&self, device_id: &str) -> anyhow::Result<Value> {
        Ok(json!({
            "deviceId": device_id,
            "serverUrl": self.server_url,
            "uploadEndpoint": "/upload",
            "syncIntervalSecs": self.sync_interval_secs,
        }))
    }
}

// =============================================================================
// State and router
// =============================================================================

#[derive(Clone)]
pub struct IngestState {
    pub store: SharedStore,
    pub upload_dir: Arc<PathBuf>,
    pub api_key_prefix: Arc<str>,
    pub events: EventBus,
    pub config_provider: Arc<dyn DeviceConfigProvider>,
}

impl IngestState {
    pub fn new(
        store: SharedStore,
        upload_dir: PathBuf,
        events: EventBus,
        config_provider: Arc<dyn DeviceConfigProvider>,
    ) -> Self {
        Self {
            store,
            upload_dir: Arc::new(upload_dir),
            api_key_prefix: Arc::from(DEFAULT_API_KEY_PREFIX),
            events,
            config_provider,
        }
    }

    pub fn with_api_key_prefix(mut self, prefix: &str) -> Self {
        self.api_key_prefix = Arc::from(prefix);
        self
    }
}

pub fn router(state: IngestState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(device_config))
        .route("/upload", any(upload))
        .fallback(not_found)
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: IngestState) -> anyhow::Result<()> {
    let addr = listener.local_addr().ok();
    info!(addr = ?addr, upload_dir = %state.upload_dir.display(), "ingestion server listening");
    axum::serve(listener, router(state))
        .await
        .context("ingestion server failed")
}

/// Bind `0.0.0.0:port` and serve until `shutdown` resolves.
pub async fn run(
    port: u16,
    state: IngestState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding ingestion server to {addr}"))?;
    info!(%addr, "ingestion server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("ingestion server failed")
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<IngestState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uploadDirectory": state.upload_dir.display().to_string(),
    }))
}

async fn device_config(
    State(state): State<IngestState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, IngestError> {
    let device_id = params
        .get("device_id")
        .filter(|id| !id.is_empty())
        .ok_or(IngestError::MissingDeviceId)?;
    let config = state.config_provider.device_config(device_id)?;
    debug!(device_id = %device_id, "served device config");
    Ok(Json(config))
}

async fn not_found(request: Request) -> Response {
    let path = request.uri().path().to_string();
    drain(request.into_body()).await;
    IngestError::NotFound(path).into_response()
}

/// JSON body of a successful upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub status: &'static str,
    pub message: String,
    pub document_id: String,
    pub page_id: String,
    pub notebook: String,
    pub section: String,
    pub page: String,
    pub size: u64,
    pub timestamp: String,
}

async fn upload(State(state): State<IngestState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let rejection = if parts.method != Method::POST {
        Some(IngestError::MethodNotAllowed(parts.method.clone()))
    } else {
        validate_api_key(&parts.headers, &state.api_key_prefix).err()
    };
    if let Some(err) = rejection {
        warn!(error = %err, "upload rejected");
        drain(body).await;
        return err.into_response();
    }

    match receive_page(&state, &parts.headers, body).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn receive_page(
    state: &IngestState,
    headers: &HeaderMap,
    body: Body,
) -> Result<UploadSummary, IngestError> {
    let name = match header_value(headers, FILENAME_HEADER)
        .ok_or_else(|| IngestError::MalformedHeader {
            header: "X-Filename",
            reason: "missing".into(),
        })
        .and_then(|raw| UploadName::parse(&raw))
    {
        Ok(name) => name,
        Err(e) => {
            drain(body).await;
            return Err(e);
        }
    };
    let virtual_path = header_value(headers, DOCUMENT_PATH_HEADER).unwrap_or_default();

    let received_at = chrono::Utc::now();
    let doc_dir = state.upload_dir.join(&name.document_id);
    tokio::fs::create_dir_all(&doc_dir).await?;
    let local_path = doc_dir.join(format!(
        "{}_{}.{}",
        name.page_id,
        received_at.format("%Y%m%d_%H%M%S%3f"),
        name.extension
    ));

    let (size_bytes, content_hash) = match stream_to_file(body, &local_path).await {
        Ok(written) => written,
        Err(e) => {
            let _ = tokio::fs::remove_file(&local_path).await;
            return Err(e);
        }
    };

    let destination = decompose(&virtual_path);
    let now = PageStore::now_millis();
    let record = PageRecord {
        document_id: name.document_id.clone(),
        page_id: name.page_id.clone(),
        virtual_path: virtual_path.clone(),
        local_path: local_path.clone(),
        size_bytes,
        content_hash,
        notebook: destination.notebook.clone(),
        section: destination.section.clone(),
        page_name: destination.page.clone(),
        status: PageStatus::Pending,
        retry_count: 0,
        last_error: None,
        cloud_page_id: None,
        last_sync_time: None,
        created_at: now,
        last_modified: now,
    };
    let (visible_name, parent) = document_parts(&virtual_path);
    let document = DocumentRecord {
        document_id: name.document_id.clone(),
        visible_name,
        parent,
        last_modified: now,
    };

    let replaced = {
        let store = state.store.lock();
        store.upsert_document(&document)?;
        let previous = store.get_page(&record.key())?;
        store.save_page(&record)?;
        previous
            .map(|p| p.local_path)
            .filter(|path| *path != record.local_path)
    };
    if let Some(old) = replaced {
        if let Err(e) = tokio::fs::remove_file(&old).await {
            debug!(path = %old.display(), error = %e, "superseded page file not removed");
        }
    }

    info!(
        document_id = %record.document_id,
        page_id = %record.page_id,
        notebook = %record.notebook,
        section = %record.section,
        size = size_bytes,
        "page received"
    );
    state.events.publish(SyncEvent::PageReceived {
        document_id: record.document_id.clone(),
        page_id: record.page_id.clone(),
        notebook: record.notebook.clone(),
        section: record.section.clone(),
        page: record.page_name.clone(),
        size_bytes,
    });

    Ok(UploadSummary {
        status: "success",
        message: format!("Page {} received", record.key()),
        document_id: record.document_id,
        page_id: record.page_id,
        notebook: destination.notebook,
        section: destination.section,
        page: destination.page,
        size: size_bytes,
        timestamp: received_at.to_rfc3339(),
    })
}

/// Write the body to `path`, returning its size and SHA-256.
async fn stream_to_file(body: Body, path: &Path) -> Result<(u64, String), IngestError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| IngestError::Internal(format!("reading request body: {e}")))?;
        hasher.update(&chunk);
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok((size, hex::encode(hasher.finalize())))
}

/// Read and discard whatever is left of a request body.
async fn drain(body: Body) {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        if chunk.is_err() {
            break;
        }
    }
}

fn validate_api_key(headers: &HeaderMap, prefix: &str) -> Result<(), IngestError> {
    match header_value(headers, API_KEY_HEADER) {
        Some(key) if key.starts_with(prefix) => Ok(()),
        _ => Err(IngestError::InvalidApiKey),
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
}

/// Parsed `X-Filename`: `{documentId}/{pageId}.{ext}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadName {
    pub document_id: String,
    pub page_id: String,
    pub extension: String,
}

impl UploadName {
    pub fn parse(raw: &str) -> Result<Self, IngestError> {
        let malformed = |reason: &str| IngestError::MalformedHeader {
            header: "X-Filename",
            reason: format!("{reason}: {raw:?}"),
        };

        let (document_id, file) = raw
            .split_once('/')
            .ok_or_else(|| malformed("expected {documentId}/{pageId}.ext"))?;
        let (page_id, extension) = file
            .rsplit_once('.')
            .ok_or_else(|| malformed("missing file extension"))?;

        for part in [document_id, page_id] {
            if !is_safe_component(part) {
                return Err(malformed("unsafe path component"));
            }
        }
        if extension.is_empty() || !extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(malformed("invalid file extension"));
        }

        Ok(Self {
            document_id: document_id.to_string(),
            page_id: page_id.to_string(),
            extension: extension.to_ascii_lowercase(),
        })
    }
}

/// Non-empty, no separators, no leading dot (covers `.` and `..`).
fn is_safe_component(part: &str) -> bool {
    !part.is_empty()
        && !part.starts_with('.')
        && !part.contains(['/', '\\', '\0'])
}
