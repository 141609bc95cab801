mod util;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use inkbridge::cloud::{CloudError, NotebookClient, PageUpload};
use inkbridge::events::{EventBus, SyncEvent};
use inkbridge::ingest::{self, IngestState, StaticConfigProvider};
use inkbridge::model::types::{PageKey, PageStatus};
use inkbridge::queue::{PassOutcome, PassReport, UploadQueueProcessor};
use inkbridge::storage::{self, PageStore, SharedStore};
use inkbridge::sync::run_sync_loop;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use util::{RecordingNotebookClient, TestTracing, pending_page};

fn store() -> SharedStore {
    storage::shared(PageStore::open_in_memory().unwrap())
}

fn completed(outcome: PassOutcome) -> PassReport {
    match outcome {
        PassOutcome::Completed(report) => report,
        PassOutcome::AlreadyRunning => panic!("pass unexpectedly skipped"),
    }
}

fn status_of(store: &SharedStore, doc: &str, page: &str) -> inkbridge::model::types::PageRecord {
    store
        .lock()
        .get_page(&PageKey::new(doc, page))
        .unwrap()
        .expect("page exists")
}

#[tokio::test]
async fn failed_page_is_retried_after_reset() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    {
        let s = store.lock();
        s.save_page(&pending_page(tmp.path(), "doc1", "page1", "Physics/Ch1/Page 1", 2_000))
            .unwrap();
        s.save_page(&pending_page(tmp.path(), "doc1", "page2", "Physics/Ch1/Page 2", 1_000))
            .unwrap();
    }
    let client = RecordingNotebookClient::new();
    client.fail_title("Page 2");
    let processor = UploadQueueProcessor::new(store.clone(), client, EventBus::new());
    let cancel = CancellationToken::new();

    let first = completed(processor.run_pass(&cancel).await.unwrap());
    assert_eq!((first.attempted, first.uploaded, first.failed), (2, 1, 1));

    let ok = status_of(&store, "doc1", "page1");
    assert_eq!(ok.status, PageStatus::Uploaded);
    assert_eq!(ok.retry_count, 0);
    assert!(ok.cloud_page_id.is_some());
    assert!(ok.last_sync_time.is_some());

    let failed = status_of(&store, "doc1", "page2");
    assert_eq!(failed.status, PageStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert!(failed.cloud_page_id.is_none());
    assert!(failed.last_error.as_deref().unwrap().contains("503"));

    assert_eq!(processor.retry_failed().unwrap(), 1);
    let reset = status_of(&store, "doc1", "page2");
    assert_eq!(reset.status, PageStatus::Pending);
    assert_eq!(reset.retry_count, 1, "reset keeps history");

    processor.client().heal();
    let second = completed(processor.run_pass(&cancel).await.unwrap());
    assert_eq!((second.attempted, second.uploaded), (1, 1));

    let healed = status_of(&store, "doc1", "page2");
    assert_eq!(healed.status, PageStatus::Uploaded);
    assert_eq!(healed.retry_count, 1, "success never bumps retry_count");
    assert_eq!(healed.last_error, None);
    assert!(healed.cloud_page_id.is_some());
}

#[tokio::test]
async fn repeated_failures_keep_counting() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    store
        .lock()
        .save_page(&pending_page(tmp.path(), "d", "p1", "Notes/p1", 1))
        .unwrap();
    let client = RecordingNotebookClient::new();
    client.fail_title("p1");
    let processor = UploadQueueProcessor::new(store.clone(), client, EventBus::new());
    let cancel = CancellationToken::new();

    for expected in 1..=3 {
        completed(processor.run_pass(&cancel).await.unwrap());
        assert_eq!(status_of(&store, "d", "p1").retry_count, expected);
        processor.retry_failed().unwrap();
    }
}

#[tokio::test]
async fn newest_pages_go_first_within_batch_limit() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    {
        let s = store.lock();
        s.save_page(&pending_page(tmp.path(), "d", "old", "Notes/old", 1_000))
            .unwrap();
        s.save_page(&pending_page(tmp.path(), "d", "newest", "Notes/newest", 3_000))
            .unwrap();
        s.save_page(&pending_page(tmp.path(), "d", "middle", "Notes/middle", 2_000))
            .unwrap();
    }
    let processor = UploadQueueProcessor::new(
        store.clone(),
        RecordingNotebookClient::new(),
        EventBus::new(),
    )
    .with_batch_size(2);

    let report = completed(processor.run_pass(&CancellationToken::new()).await.unwrap());

    assert_eq!(report.attempted, 2);
    assert_eq!(processor.client().uploaded_titles(), vec!["newest", "middle"]);
    assert_eq!(status_of(&store, "d", "old").status, PageStatus::Pending);
}

#[tokio::test]
async fn notebook_and_section_resolved_once_per_pass() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    {
        let s = store.lock();
        for (i, page) in ["Page 1", "Page 2", "Page 3"].iter().enumerate() {
            s.save_page(&pending_page(
                tmp.path(),
                "doc",
                &format!("p{i}"),
                &format!("Physics/Ch1/{page}"),
                i as i64,
            ))
            .unwrap();
        }
        s.save_page(&pending_page(tmp.path(), "doc", "p9", "Physics/Ch2/Page 1", 0))
            .unwrap();
    }
    let processor = UploadQueueProcessor::new(
        store.clone(),
        RecordingNotebookClient::new(),
        EventBus::new(),
    );

    completed(processor.run_pass(&CancellationToken::new()).await.unwrap());

    let client = processor.client();
    assert_eq!(client.calls_matching("create_notebook"), 1);
    assert_eq!(client.calls_matching("find_notebook"), 1);
    assert_eq!(client.calls_matching("create_section"), 2);
    assert_eq!(client.calls_matching("upload_page"), 4);
    let state = client.state.lock().unwrap();
    assert!(state.notebooks.contains_key("Tablet - Physics"));
}

#[tokio::test]
async fn existing_containers_are_reused() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    store
        .lock()
        .save_page(&pending_page(tmp.path(), "d", "p1", "Journal/Monday", 1))
        .unwrap();
    let client = RecordingNotebookClient::new();
    {
        let mut state = client.state.lock().unwrap();
        state
            .notebooks
            .insert("Tablet - Journal".into(), "nb-existing".into());
        state
            .sections
            .insert(("nb-existing".into(), "Journal".into()), "sec-existing".into());
    }
    let processor = UploadQueueProcessor::new(store.clone(), client, EventBus::new());

    completed(processor.run_pass(&CancellationToken::new()).await.unwrap());

    let client = processor.client();
    assert_eq!(client.calls_matching("create_"), 0);
    let state = client.state.lock().unwrap();
    assert_eq!(state.pages[0].0, "sec-existing");
}

#[tokio::test]
async fn upload_carries_metadata_panel() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    store
        .lock()
        .save_page(&pending_page(tmp.path(), "doc123", "page7", "Physics/Ch1/Page 3", 1))
        .unwrap();
    let processor = UploadQueueProcessor::new(
        store.clone(),
        RecordingNotebookClient::new(),
        EventBus::new(),
    );

    completed(processor.run_pass(&CancellationToken::new()).await.unwrap());

    let state = processor.client().state.lock().unwrap();
    let (_, upload) = &state.pages[0];
    assert_eq!(upload.title, "Page 3");
    assert_eq!(upload.filename, "page7.rm");
    assert_eq!(upload.bytes, b"page doc123/page7");
    assert_eq!(upload.metadata.virtual_path, "Physics/Ch1/Page 3");
    assert_eq!(upload.metadata.document_id, "doc123");
    assert_eq!(upload.metadata.page_number, Some(7));
    assert!(!upload.metadata.imported_at.is_empty());
}

#[tokio::test]
async fn missing_local_file_fails_without_stopping_batch() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    let gone = pending_page(tmp.path(), "d", "gone", "Notes/gone", 2);
    std::fs::remove_file(&gone.local_path).unwrap();
    {
        let s = store.lock();
        s.save_page(&gone).unwrap();
        s.save_page(&pending_page(tmp.path(), "d", "here", "Notes/here", 1))
            .unwrap();
    }
    let processor = UploadQueueProcessor::new(
        store.clone(),
        RecordingNotebookClient::new(),
        EventBus::new(),
    );
    let logs = TestTracing::new();
    let _guard = logs.install();

    let report = completed(processor.run_pass(&CancellationToken::new()).await.unwrap());

    assert_eq!((report.uploaded, report.failed), (1, 1));
    logs.assert_contains("page upload failed");
    logs.assert_contains("page=d/gone");
    let failed = status_of(&store, "d", "gone");
    assert_eq!(failed.status, PageStatus::Failed);
    assert!(failed.last_error.unwrap().contains("reading"));
}

#[tokio::test]
async fn progress_events_are_published() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    store
        .lock()
        .save_page(&pending_page(tmp.path(), "d", "p1", "Notes/p1", 1))
        .unwrap();
    let bus = EventBus::new();
    let mut rx = bus.subscribe();
    let processor = UploadQueueProcessor::new(store, RecordingNotebookClient::new(), bus);

    completed(processor.run_pass(&CancellationToken::new()).await.unwrap());

    match rx.try_recv().unwrap() {
        SyncEvent::QueueProgress {
            document_id,
            uploaded,
            processed,
            total,
            ..
        } => {
            assert_eq!(document_id, "d");
            assert!(uploaded);
            assert_eq!((processed, total), (1, 1));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn empty_queue_is_a_quiet_pass() {
    let processor =
        UploadQueueProcessor::new(store(), RecordingNotebookClient::new(), EventBus::new());
    let report = completed(processor.run_pass(&CancellationToken::new()).await.unwrap());
    assert_eq!(report, PassReport::default());
}

/// Wraps the recording client; `upload_page` parks until released and can
/// fire a cancellation token on entry.
struct GatedClient {
    inner: RecordingNotebookClient,
    entered: Arc<Notify>,
    release: Option<Arc<Notify>>,
    cancel_on_upload: Option<CancellationToken>,
}

#[async_trait]
impl NotebookClient for GatedClient {
    async fn find_notebook(&self, name: &str) -> Result<Option<String>, CloudError> {
        self.inner.find_notebook(name).await
    }

    async fn create_notebook(&self, name: &str) -> Result<String, CloudError> {
        self.inner.create_notebook(name).await
    }

    async fn find_section(&self, nb: &str, name: &str) -> Result<Option<String>, CloudError> {
        self.inner.find_section(nb, name).await
    }

    async fn create_section(&self, nb: &str, name: &str) -> Result<String, CloudError> {
        self.inner.create_section(nb, name).await
    }

    async fn upload_page(&self, section_id: &str, page: &PageUpload) -> Result<String, CloudError> {
        self.entered.notify_one();
        if let Some(token) = &self.cancel_on_upload {
            token.cancel();
        }
        if let Some(release) = &self.release {
            release.notified().await;
        }
        self.inner.upload_page(section_id, page).await
    }
}

#[tokio::test]
async fn second_pass_while_running_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    store
        .lock()
        .save_page(&pending_page(tmp.path(), "d", "p1", "Notes/p1", 1))
        .unwrap();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let processor = Arc::new(UploadQueueProcessor::new(
        store.clone(),
        GatedClient {
            inner: RecordingNotebookClient::new(),
            entered: entered.clone(),
            release: Some(release.clone()),
            cancel_on_upload: None,
        },
        EventBus::new(),
    ));

    let running = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.run_pass(&CancellationToken::new()).await })
    };
    entered.notified().await;
    assert!(processor.is_running());

    let second = processor.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(second, PassOutcome::AlreadyRunning);

    release.notify_one();
    let first = completed(running.await.unwrap().unwrap());
    assert_eq!(first.uploaded, 1);
    assert!(!processor.is_running());
    assert_eq!(processor.client().inner.calls_matching("upload_page"), 1);
}

async fn push_page(router: &axum::Router, body: &'static [u8]) {
    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("X-API-Key", "ink_k")
        .header("X-Filename", "doc/p1.rm")
        .header("X-Document-Path", "Journal/Monday")
        .body(Body::from(body))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn page_resent_during_upload_stays_pending() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    let router = ingest::router(IngestState::new(
        store.clone(),
        tmp.path().join("uploads"),
        EventBus::new(),
        Arc::new(StaticConfigProvider {
            server_url: "http://10.11.99.2:8080".into(),
            sync_interval_secs: 300,
        }),
    ));
    push_page(&router, b"OLD").await;

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let processor = Arc::new(UploadQueueProcessor::new(
        store.clone(),
        GatedClient {
            inner: RecordingNotebookClient::new(),
            entered: entered.clone(),
            release: Some(release.clone()),
            cancel_on_upload: None,
        },
        EventBus::new(),
    ));
    let running = {
        let processor = processor.clone();
        tokio::spawn(async move { processor.run_pass(&CancellationToken::new()).await })
    };

    entered.notified().await;
    push_page(&router, b"NEW VERSION").await;
    release.notify_one();

    let first = completed(running.await.unwrap().unwrap());
    assert_eq!((first.attempted, first.uploaded, first.failed), (1, 0, 0));
    assert_eq!(first.superseded, 1);

    let record = status_of(&store, "doc", "p1");
    assert_eq!(record.status, PageStatus::Pending);
    assert_eq!(record.size_bytes, 11);
    assert_eq!(record.retry_count, 0);
    assert_eq!(record.cloud_page_id, None);
    assert_eq!(std::fs::read(&record.local_path).unwrap(), b"NEW VERSION");

    // The next pass sends the version the device pushed last.
    release.notify_one();
    let second = completed(processor.run_pass(&CancellationToken::new()).await.unwrap());
    assert_eq!(second.uploaded, 1);
    assert_eq!(status_of(&store, "doc", "p1").status, PageStatus::Uploaded);

    let state = processor.client().inner.state.lock().unwrap();
    let sent: Vec<&[u8]> = state.pages.iter().map(|(_, p)| p.bytes.as_slice()).collect();
    assert_eq!(sent, vec![&b"OLD"[..], &b"NEW VERSION"[..]]);
}

#[tokio::test]
async fn cancellation_waits_for_in_flight_page() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    {
        let s = store.lock();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            s.save_page(&pending_page(tmp.path(), "d", id, &format!("Notes/{id}"), i as i64))
                .unwrap();
        }
    }
    let cancel = CancellationToken::new();
    let processor = UploadQueueProcessor::new(
        store.clone(),
        GatedClient {
            inner: RecordingNotebookClient::new(),
            entered: Arc::new(Notify::new()),
            release: None,
            cancel_on_upload: Some(cancel.clone()),
        },
        EventBus::new(),
    );

    let report = completed(processor.run_pass(&cancel).await.unwrap());

    assert!(report.cancelled);
    assert_eq!((report.attempted, report.uploaded), (1, 1));
    assert_eq!(status_of(&store, "d", "c").status, PageStatus::Uploaded);
    assert_eq!(status_of(&store, "d", "b").status, PageStatus::Pending);
    assert_eq!(status_of(&store, "d", "a").status, PageStatus::Pending);
}

#[tokio::test]
async fn sync_loop_runs_until_cancelled() {
    let tmp = TempDir::new().unwrap();
    let store = store();
    store
        .lock()
        .save_page(&pending_page(tmp.path(), "d", "p1", "Notes/p1", 1))
        .unwrap();
    let processor = Arc::new(UploadQueueProcessor::new(
        store.clone(),
        RecordingNotebookClient::new(),
        EventBus::new(),
    ));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_sync_loop(
        processor,
        Duration::from_secs(3600),
        cancel.clone(),
    ));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while status_of(&store, "d", "p1").status != PageStatus::Uploaded {
        assert!(tokio::time::Instant::now() < deadline, "first cycle never ran");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cancel.cancel();

    let cycles = task.await.unwrap().unwrap();
    assert_eq!(cycles, 1);
}
