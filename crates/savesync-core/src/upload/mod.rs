//! Cancellable, progress-reporting upload of a compressed save.
//!
//! One call runs three steps:
//!
//! 1. compress on a fresh [`CompressionPipeline`] worker (0..50%),
//! 2. package the result with JSON [`UploadMetadata`] as multipart,
//! 3. POST it, reporting bytes as they are pulled into the request (50..100%).
//!
//! The cancellation token is only honoured around the network step;
//! compression always runs to completion. The compression worker is released
//! on every path out of [`ChunkedUploader::upload`].

pub mod body;
pub mod progress;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeError, BridgeOptions, TransferBuffer};
use crate::compression::{CompressionPipeline, ZstdLoader};

pub use progress::{ProgressReporter, UploadProgress, UploadStage};

/// JSON carried in the multipart `metadata` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub content_type: String,
    pub filename: String,
    pub original_size: u64,
    pub compressed_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("upload aborted")]
    Aborted,

    #[error("upload transport failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("server rejected upload ({status}): {msg}")]
    Server { status: u16, msg: String },

    #[error("upload failed with status {status}")]
    Unknown { status: u16, body: String },

    #[error("compression failed: {0}")]
    Compression(#[from] BridgeError),

    #[error("failed to encode upload metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("failed to build upload request: {0}")]
    Request(#[source] reqwest::Error),
}

impl UploadError {
    /// Whether trying the same upload again could succeed.
    pub fn is_retry_safe(&self) -> bool {
        match self {
            UploadError::Transport(_) | UploadError::Unknown { .. } => true,
            UploadError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Message suitable for showing to the person who started the upload.
    pub fn user_message(&self) -> String {
        match self {
            UploadError::Server { msg, .. } => msg.clone(),
            UploadError::Aborted => "Upload cancelled".to_string(),
            UploadError::Transport(_) | UploadError::Unknown { .. } => {
                "Upload failed. Please try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    msg: String,
}

/// Classify a non-2xx response by its body.
pub fn error_from_response(status: u16, body: &[u8]) -> UploadError {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody { msg }) => UploadError::Server { status, msg },
        Err(_) => UploadError::Unknown {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        },
    }
}

/// What to upload and where.
#[derive(Debug)]
pub struct UploadRequest {
    pub url: String,
    pub payload: TransferBuffer,
    pub filename: String,
    pub extra: Option<serde_json::Value>,
}

impl UploadRequest {
    pub fn new(url: impl Into<String>, payload: TransferBuffer) -> Self {
        Self {
            url: url.into(),
            payload,
            filename: "save.bin".to_string(),
            extra: None,
        }
    }

    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// A successful upload. The server's body is kept as-is.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub status: u16,
    pub body: Bytes,
    pub metadata: UploadMetadata,
}

#[derive(Debug, Clone)]
pub struct ChunkedUploader {
    client: reqwest::Client,
    compression: ZstdLoader,
    bridge_options: BridgeOptions,
    chunk_size: usize,
}

impl ChunkedUploader {
    pub fn new(client: reqwest::Client, compression: ZstdLoader) -> Self {
        Self {
            client,
            compression,
            bridge_options: BridgeOptions::named("upload-compression"),
            chunk_size: body::DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_bridge_options(mut self, options: BridgeOptions) -> Self {
        self.bridge_options = options;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub async fn upload<F>(
        &self,
        request: UploadRequest,
        cancel: Option<&CancellationToken>,
        on_progress: F,
    ) -> Result<UploadReceipt, UploadError>
    where
        F: FnMut(UploadProgress),
    {
        let mut reporter = ProgressReporter::new(on_progress);
        let pipeline = CompressionPipeline::spawn(self.compression.clone(), self.bridge_options.clone())?;

        let outcome = self.run(&pipeline, request, cancel, &mut reporter).await;
        pipeline.release().await;

        match &outcome {
            Ok(receipt) => info!(
                status = receipt.status,
                compressed_size = receipt.metadata.compressed_size,
                "upload complete"
            ),
            Err(e) => warn!(error = %e, "upload failed"),
        }
        outcome
    }

    async fn run<F>(
        &self,
        pipeline: &CompressionPipeline,
        request: UploadRequest,
        cancel: Option<&CancellationToken>,
        reporter: &mut ProgressReporter<F>,
    ) -> Result<UploadReceipt, UploadError>
    where
        F: FnMut(UploadProgress),
    {
        let UploadRequest {
            url,
            payload,
            filename,
            extra,
        } = request;

        let (probe, compressed) = pipeline
            .run(payload, |percent| reporter.stage(UploadStage::Compress, percent))
            .await?;
        debug!(kind = ?probe.kind, grew = compressed.grew(), "payload compressed");

        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(UploadError::Aborted);
        }

        let metadata = UploadMetadata {
            content_type: compressed.content_type.clone(),
            filename,
            original_size: compressed.original_size,
            compressed_size: compressed.compressed_size,
            extra,
        };
        let total = compressed.compressed_size;

        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel();
        let form = body::build_form(Bytes::from(compressed.bytes), &metadata, self.chunk_size, sent_tx)?;
        reporter.network(0, total);

        let send = self.client.post(&url).multipart(form).send();
        tokio::pin!(send);
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancelled);

        let mut sent = 0u64;
        let response = loop {
            tokio::select! {
                biased;
                _ = &mut cancelled => {
                    info!(url = %url, sent, total, "upload cancelled during transfer");
                    return Err(UploadError::Aborted);
                }
                Some(bytes) = sent_rx.recv() => {
                    sent += bytes;
                    reporter.network(sent, total);
                }
                result = &mut send => break result.map_err(UploadError::Transport)?,
            }
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = &mut cancelled => return Err(UploadError::Aborted),
            body = response.bytes() => body.map_err(UploadError::Transport)?,
        };

        if !status.is_success() {
            return Err(error_from_response(status.as_u16(), &body));
        }

        reporter.finish();
        Ok(UploadReceipt {
            status: status.as_u16(),
            body,
            metadata,
        })
    }
}
