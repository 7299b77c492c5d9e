//! Multipart body construction with byte-level send tracking.

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use tokio::sync::mpsc;

use super::{UploadError, UploadMetadata};

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Stream `bytes` in `chunk_size` slices. Each slice's length is reported on
/// `sent` as the HTTP client pulls it. Slicing shares the one allocation.
pub fn tracked_body(bytes: Bytes, chunk_size: usize, sent: mpsc::UnboundedSender<u64>) -> reqwest::Body {
    let chunk_size = chunk_size.max(1);
    let stream = async_stream::stream! {
        let total = bytes.len();
        let mut offset = 0;
        while offset < total {
            let end = (offset + chunk_size).min(total);
            let chunk = bytes.slice(offset..end);
            offset = end;
            // Nobody listening just means nobody wants progress.
            let _ = sent.send(chunk.len() as u64);
            yield Ok::<Bytes, std::io::Error>(chunk);
        }
    };
    reqwest::Body::wrap_stream(stream)
}

/// `file` (the compressed bytes) and `metadata` (JSON) parts.
pub fn build_form(
    bytes: Bytes,
    metadata: &UploadMetadata,
    chunk_size: usize,
    sent: mpsc::UnboundedSender<u64>,
) -> Result<Form, UploadError> {
    let len = bytes.len() as u64;
    let file = Part::stream_with_length(tracked_body(bytes, chunk_size, sent), len)
        .file_name(metadata.filename.clone())
        .mime_str(&metadata.content_type)
        .map_err(UploadError::Request)?;

    let metadata = Part::text(serde_json::to_string(metadata)?)
        .mime_str("application/json")
        .map_err(UploadError::Request)?;

    Ok(Form::new().part("file", file).part("metadata", metadata))
}
