//! Integration tests for the chunked uploader against a local HTTP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use tokio_util::sync::CancellationToken;

use savesync_core::bridge::{BridgeOptions, ContextTracker, TransferBuffer};
use savesync_core::compression::ZstdLoader;
use savesync_core::upload::{ChunkedUploader, UploadError, UploadMetadata, UploadProgress, UploadRequest, UploadStage};
use savesync_test_utils::{init_tracing, pseudo_random_bytes, spawn_server};

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Received {
    hits: AtomicUsize,
    file: Mutex<Option<(Vec<u8>, Option<String>)>>,
    metadata: Mutex<Option<UploadMetadata>>,
}

async fn accept(State(received): State<Arc<Received>>, mut multipart: Multipart) -> impl IntoResponse {
    received.hits.fetch_add(1, Ordering::SeqCst);
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.unwrap();
        match name.as_str() {
            "file" => *received.file.lock().unwrap() = Some((data.to_vec(), content_type)),
            "metadata" => *received.metadata.lock().unwrap() = Some(serde_json::from_slice(&data).unwrap()),
            _ => {}
        }
    }
    (StatusCode::CREATED, Json(serde_json::json!({ "key": "alice/1" })))
}

async fn stall(State(received): State<Arc<Received>>) -> StatusCode {
    received.hits.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(30)).await;
    StatusCode::OK
}

fn router(received: Arc<Received>) -> Router {
    Router::new()
        .route("/upload", post(accept))
        .route("/stall", post(stall))
        .route(
            "/reject",
            post(|| async {
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(serde_json::json!({ "msg": "unsupported version 1.20" })),
                )
            }),
        )
        .route(
            "/broken",
            post(|| async { (StatusCode::BAD_GATEWAY, "<html>upstream down</html>") }),
        )
        .layer(DefaultBodyLimit::disable())
        .with_state(received)
}

fn uploader(tracker: &ContextTracker) -> ChunkedUploader {
    init_tracing();
    ChunkedUploader::new(reqwest::Client::new(), ZstdLoader::new().with_chunk_size(32 * 1024))
        .with_bridge_options(BridgeOptions::named("upload-test").with_tracker(tracker.clone()))
        .with_chunk_size(16 * 1024)
}

fn assert_monotonic(progress: &[UploadProgress]) {
    assert!(
        progress.windows(2).all(|w| w[0].percent < w[1].percent),
        "progress went backwards: {progress:?}"
    );
}

// ---------------------------------------------------------------------------
// Success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn uploads_compressed_file_and_metadata() {
    let received = Arc::new(Received::default());
    let server = spawn_server(router(Arc::clone(&received))).await;
    let tracker = ContextTracker::default();

    let original = pseudo_random_bytes(512 * 1024, 3)
        .into_iter()
        .map(|b| b % 16)
        .collect::<Vec<u8>>();
    let request = UploadRequest::new(server.url("/upload"), TransferBuffer::from(original.clone()))
        .filename("autosave.eu4")
        .extra(serde_json::json!({ "game": "eu4" }));

    let mut progress = Vec::new();
    let receipt = uploader(&tracker)
        .upload(request, None, |p| progress.push(p))
        .await
        .unwrap();

    assert_eq!(receipt.status, 201);
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&receipt.body).unwrap()["key"],
        "alice/1"
    );

    let (file, content_type) = received.file.lock().unwrap().take().unwrap();
    assert_eq!(content_type.as_deref(), Some("application/zstd"));
    assert_eq!(zstd::decode_all(&file[..]).unwrap(), original);

    let metadata = received.metadata.lock().unwrap().take().unwrap();
    assert_eq!(metadata, receipt.metadata);
    assert_eq!(metadata.filename, "autosave.eu4");
    assert_eq!(metadata.original_size, original.len() as u64);
    assert_eq!(metadata.compressed_size, file.len() as u64);
    assert_eq!(metadata.extra, Some(serde_json::json!({ "game": "eu4" })));

    assert_monotonic(&progress);
    assert!(progress.iter().any(|p| p.stage == UploadStage::Compress && p.percent <= 50));
    assert!(progress.iter().any(|p| p.stage == UploadStage::Network && p.percent > 50 && p.percent < 100));
    assert_eq!(progress.last().map(|p| p.percent), Some(100));

    assert_eq!(tracker.outstanding(), 0);
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn structured_rejection_is_a_server_error() {
    let server = spawn_server(router(Arc::default())).await;
    let tracker = ContextTracker::default();

    let err = uploader(&tracker)
        .upload(
            UploadRequest::new(server.url("/reject"), TransferBuffer::from(b"save".to_vec())),
            None,
            |_| {},
        )
        .await
        .unwrap_err();

    match &err {
        UploadError::Server { status, msg } => {
            assert_eq!(*status, 422);
            assert_eq!(msg, "unsupported version 1.20");
        }
        other => panic!("expected Server, got {other:?}"),
    }
    assert_eq!(err.user_message(), "unsupported version 1.20");
    assert_eq!(tracker.outstanding(), 0);
}

#[tokio::test]
async fn unparsable_failure_is_unknown_with_raw_body() {
    let server = spawn_server(router(Arc::default())).await;
    let tracker = ContextTracker::default();

    let err = uploader(&tracker)
        .upload(
            UploadRequest::new(server.url("/broken"), TransferBuffer::from(b"save".to_vec())),
            None,
            |_| {},
        )
        .await
        .unwrap_err();

    match err {
        UploadError::Unknown { status, body } => {
            assert_eq!(status, 502);
            assert_eq!(body, "<html>upstream down</html>");
        }
        other => panic!("expected Unknown, got {other:?}"),
    }
    assert_eq!(tracker.outstanding(), 0);
}

#[tokio::test]
async fn connection_failure_is_a_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let tracker = ContextTracker::default();

    let err = uploader(&tracker)
        .upload(
            UploadRequest::new(format!("http://{addr}/upload"), TransferBuffer::from(b"save".to_vec())),
            None,
            |_| {},
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Transport(_)), "got {err:?}");
    assert!(err.is_retry_safe());
    assert_eq!(tracker.outstanding(), 0);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn abort_during_transfer_rejects_and_releases_worker() {
    let received = Arc::new(Received::default());
    let server = spawn_server(router(Arc::clone(&received))).await;
    let tracker = ContextTracker::default();
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    let mut progress = Vec::new();
    let err = uploader(&tracker)
        .upload(
            UploadRequest::new(server.url("/stall"), TransferBuffer::from(pseudo_random_bytes(4 * 1024 * 1024, 11))),
            Some(&cancel),
            |p| {
                if p.stage == UploadStage::Network && p.percent > 50 {
                    trigger.cancel();
                }
                progress.push(p);
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Aborted), "got {err:?}");
    assert_eq!(tracker.outstanding(), 0, "compression worker leaked");
    assert_monotonic(&progress);
    assert!(progress.last().is_some_and(|p| p.percent < 100));
}

#[tokio::test]
async fn abort_during_compression_rejects_after_compression() {
    let received = Arc::new(Received::default());
    let server = spawn_server(router(Arc::clone(&received))).await;
    let tracker = ContextTracker::default();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut progress = Vec::new();
    let err = uploader(&tracker)
        .upload(
            UploadRequest::new(server.url("/upload"), TransferBuffer::from(b"save".repeat(1000))),
            Some(&cancel),
            |p| progress.push(p),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::Aborted));
    assert_eq!(progress.last().map(|p| p.percent), Some(50), "compression still completes");
    assert_eq!(received.hits.load(Ordering::SeqCst), 0, "nothing reached the server");
    assert_eq!(tracker.outstanding(), 0);
}
