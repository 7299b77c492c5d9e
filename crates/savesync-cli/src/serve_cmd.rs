use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use savesync_core::bridge::{BridgeOptions, TransferBuffer};
use savesync_core::compression::{CompressionPipeline, InputKind, sniff};
use savesync_core::ingest::{
    FsArtifactStore, HttpValidator, IngestError, IngestRequest, IngestionActor, StoreError, SubjectId, Subscription,
};

use crate::config::SavesyncConfig;

/// Largest multipart body the upload route accepts.
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
    code: Option<String>,
}

impl AppError {
    pub fn bad_request(msg: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.to_string(),
            code: None,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
            code: None,
        }
    }

    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.to_string(),
            code: None,
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::ValidationRejected { reason, code } => Self {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                message: reason,
                code: Some(code),
            },
            IngestError::ValidatorUnavailable(e) => {
                warn!(error = %e, "validator unavailable");
                Self {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: "save validation is unavailable, try again later".to_string(),
                    code: None,
                }
            }
            other => {
                error!(error = %other, "ingestion failed");
                Self::internal(other)
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::not_found(format!("artifact {key} not found")),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = serde_json::json!({ "msg": self.message });
        if let Some(code) = self.code {
            body["code"] = serde_json::Value::String(code);
        }
        (self.status, Json(body)).into_response()
    }
}

fn parse_subject(raw: &str) -> Result<SubjectId, AppError> {
    SubjectId::parse(raw).map_err(AppError::bad_request)
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub actor: Arc<IngestionActor>,
    /// Re-emits stored artifacts for download.
    pub codec: Arc<CompressionPipeline>,
}

/// Sent by a live client to move its connection to another subject.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    Subscribe { subject: SubjectId },
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/saves/{subject}", post(upload_save).get(current_save))
        .route("/api/saves/{subject}/file", get(download_save))
        .route("/api/saves/{subject}/live", get(live_updates))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(config: &SavesyncConfig, bind: &str, port: u16) -> Result<()> {
    let validator_url = config.validator_url.as_deref().context(
        "no validator URL configured; set SAVESYNC_VALIDATOR_URL or run `savesync init --validator-url <url>`",
    )?;

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("failed to create storage directory {}", config.storage_dir.display()))?;

    let store = FsArtifactStore::new(config.storage_dir.clone());
    let validator = HttpValidator::new(reqwest::Client::new(), validator_url);
    let actor = Arc::new(IngestionActor::new(Arc::new(store), Arc::new(validator)));
    let codec = Arc::new(
        CompressionPipeline::spawn(config.zstd_loader(), BridgeOptions::named("serve-transform"))
            .context("failed to start transform worker")?,
    );

    let app = build_router(AppState {
        actor: Arc::clone(&actor),
        codec: Arc::clone(&codec),
    });
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!(
        storage = %config.storage_dir.display(),
        validator = validator_url,
        "savesync serve listening on http://{addr}"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    actor.shutdown().await;
    codec.release().await;
    info!("savesync serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn upload_save(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let subject = parse_subject(&subject)?;

    let mut file = None;
    let mut metadata = serde_json::Value::Null;
    while let Some(field) = multipart.next_field().await.map_err(AppError::bad_request)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let part_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(AppError::bad_request)?;
                file = Some((bytes, part_type));
            }
            "metadata" => {
                let text = field.text().await.map_err(AppError::bad_request)?;
                metadata = serde_json::from_str(&text).map_err(AppError::bad_request)?;
            }
            other => debug!(field = other, "ignoring unknown multipart field"),
        }
    }
    let (bytes, part_type) = file.ok_or_else(|| AppError::bad_request("missing `file` part"))?;

    // The sender's declared content type wins over the part header.
    let content_type = metadata
        .get("content_type")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .or(part_type)
        .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string());

    let request = IngestRequest::new(subject, bytes, content_type).with_metadata(metadata);
    let artifact = state
        .actor
        .ingest_tracked(request)
        .await
        .map_err(|e| AppError::internal(format!("ingestion task failed: {e}")))??;

    Ok((StatusCode::CREATED, Json(artifact)).into_response())
}

async fn current_save(State(state): State<AppState>, Path(subject): Path<String>) -> Result<Response, AppError> {
    let subject = parse_subject(&subject)?;
    let artifact = state
        .actor
        .current(&subject)
        .ok_or_else(|| AppError::not_found(format!("no save for {subject}")))?;
    Ok(Json(artifact).into_response())
}

async fn download_save(State(state): State<AppState>, Path(subject): Path<String>) -> Result<Response, AppError> {
    let subject = parse_subject(&subject)?;
    let artifact = state
        .actor
        .current(&subject)
        .ok_or_else(|| AppError::not_found(format!("no save for {subject}")))?;

    let stored = state.actor.store().get(&artifact.key).await?;
    let restored = state
        .codec
        .transform(TransferBuffer::from(stored.bytes))
        .await
        .map_err(AppError::internal)?
        .into_bytes();

    let content_type = match sniff(&restored) {
        InputKind::Zip => "application/zip",
        InputKind::Zstd | InputKind::Binary => FALLBACK_CONTENT_TYPE,
    };
    Ok(([(header::CONTENT_TYPE, content_type)], restored).into_response())
}

async fn live_updates(
    State(state): State<AppState>,
    Path(subject): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let subject = parse_subject(&subject)?;
    // Join before the upgrade completes so no commit in between is missed.
    let subscription = state.actor.subscribe(subject);
    Ok(ws.on_upgrade(move |socket| forward_updates(socket, subscription)))
}

async fn forward_updates(mut socket: WebSocket, mut subscription: Subscription) {
    loop {
        tokio::select! {
            update = subscription.recv() => {
                let Some(update) = update else { break };
                let text = match serde_json::to_string(&update) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to encode live update");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Subscribe { subject }) => subscription.resubscribe(subject),
                    Err(e) => debug!(error = %e, "ignoring malformed live message"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(subject = %subscription.subject(), "live connection closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use savesync_core::bridge::{BridgeOptions, ContextTracker, TransferBuffer};
    use savesync_core::compression::{CompressionPipeline, ZstdLoader};
    use savesync_core::ingest::{
        IngestionActor, LiveMessage, MemoryArtifactStore, SubjectId, Validator,
    };
    use savesync_core::upload::{ChunkedUploader, UploadRequest};
    use savesync_test_utils::{StaticValidator, UnreachableValidator, init_tracing, spawn_server};

    use super::AppState;

    const BOUNDARY: &str = "savesync-test-boundary";

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn app_state(validator: impl Validator + 'static) -> (AppState, ContextTracker) {
        init_tracing();
        let tracker = ContextTracker::default();
        let codec = CompressionPipeline::spawn(
            ZstdLoader::new(),
            BridgeOptions::named("serve-test").with_tracker(tracker.clone()),
        )
        .unwrap();
        let actor = IngestionActor::new(Arc::new(MemoryArtifactStore::new()), Arc::new(validator));
        let state = AppState {
            actor: Arc::new(actor),
            codec: Arc::new(codec),
        };
        (state, tracker)
    }

    fn multipart_body(parts: &[(&str, &str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, content_type, data) in parts {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\n\
                     Content-Type: {content_type}\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn upload_request(subject: &str, file: &[u8]) -> Request<Body> {
        let metadata = serde_json::json!({
            "content_type": "application/zstd",
            "filename": "autosave.eu4",
        })
        .to_string();
        let body = multipart_body(&[
            ("file", "application/zstd", file),
            ("metadata", "application/json", metadata.as_bytes()),
        ]);
        Request::builder()
            .method("POST")
            .uri(format!("/api/saves/{subject}"))
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(state: &AppState, request: Request<Body>) -> axum::response::Response {
        super::build_router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn get(state: &AppState, uri: &str) -> axum::response::Response {
        send(state, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), 16 * 1_048_576)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn accepted_upload_is_committed_and_downloadable() {
        let (state, tracker) = app_state(StaticValidator::accepting());
        let original = b"EU4txt date=1444.11.11 ".repeat(64);
        let compressed = zstd::encode_all(&original[..], 3).unwrap();

        let resp = send(&state, upload_request("alice", &compressed)).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let created = body_json(resp).await;
        assert_eq!(created["state"], "committed");
        assert_eq!(created["content_type"], "application/zstd");
        assert_eq!(created["metadata"]["filename"], "autosave.eu4");
        assert!(created["key"].as_str().unwrap().starts_with("alice/"));

        let resp = get(&state, "/api/saves/alice").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["key"], created["key"]);

        let resp = get(&state, "/api/saves/alice/file").await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap().to_str().unwrap(),
            "application/octet-stream"
        );
        assert_eq!(body_bytes(resp).await, original);

        state.codec.release().await;
        assert_eq!(tracker.outstanding(), 0);
    }

    #[tokio::test]
    async fn rejected_upload_returns_422_with_code() {
        let (state, _tracker) = app_state(StaticValidator::rejecting("unsupported-patch", "unsupported version 1.20"));

        let resp = send(&state, upload_request("alice", b"save")).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = body_json(resp).await;
        assert_eq!(json["msg"], "unsupported version 1.20");
        assert_eq!(json["code"], "unsupported-patch");

        let resp = get(&state, "/api/saves/alice").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(body_json(resp).await["msg"].is_string());
    }

    #[tokio::test]
    async fn unreachable_validator_returns_503() {
        let (state, _tracker) = app_state(UnreachableValidator);
        let resp = send(&state, upload_request("alice", b"save")).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.actor.current(&SubjectId::parse("alice").unwrap()).is_none());
    }

    #[tokio::test]
    async fn invalid_subject_is_a_bad_request() {
        let (state, _tracker) = app_state(StaticValidator::accepting());
        let resp = send(&state, upload_request("al.ice", b"save")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = get(&state, "/api/saves/al.ice").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_without_file_part_is_a_bad_request() {
        let (state, _tracker) = app_state(StaticValidator::accepting());
        let body = multipart_body(&[("metadata", "application/json", b"{}")]);
        let request = Request::builder()
            .method("POST")
            .uri("/api/saves/alice")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from(body))
            .unwrap();

        let resp = send(&state, request).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["msg"], "missing `file` part");
    }

    #[tokio::test]
    async fn download_without_current_save_is_not_found() {
        let (state, _tracker) = app_state(StaticValidator::accepting());
        let resp = get(&state, "/api/saves/alice/file").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn chunked_uploader_round_trip_notifies_subscribers() {
        let (state, _tracker) = app_state(StaticValidator::accepting());
        let mut subscription = state.actor.subscribe(SubjectId::parse("alice").unwrap());
        let server = spawn_server(super::build_router(state.clone())).await;

        let original = b"EU4bin player=FRA ".repeat(4096);
        let request = UploadRequest::new(server.url("/api/saves/alice"), TransferBuffer::from(original.clone()))
            .filename("autosave.eu4");
        let receipt = ChunkedUploader::new(reqwest::Client::new(), ZstdLoader::new())
            .upload(request, None, |_| {})
            .await
            .unwrap();
        assert_eq!(receipt.status, 201);

        let created: serde_json::Value = serde_json::from_slice(&receipt.body).unwrap();
        let current = state.actor.current(&SubjectId::parse("alice").unwrap()).unwrap();
        assert_eq!(created["key"], current.key.to_string());
        assert_eq!(current.content_type, "application/zstd");
        assert_eq!(current.size, receipt.metadata.compressed_size);

        let update = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
            .await
            .unwrap();
        assert_eq!(update, Some(LiveMessage::Updated { key: current.key }));

        let resp = get(&state, "/api/saves/alice/file").await;
        assert_eq!(body_bytes(resp).await, original);
    }
}
