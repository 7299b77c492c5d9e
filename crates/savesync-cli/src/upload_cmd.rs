use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use savesync_core::bridge::TransferBuffer;
use savesync_core::ingest::SubjectId;
use savesync_core::upload::{ChunkedUploader, UploadProgress, UploadRequest, UploadStage};

use crate::config::SavesyncConfig;

/// Execute `savesync upload`: compress `file` and push it to the server
/// under `subject`. Ctrl+C aborts the transfer.
pub async fn run_upload(config: &SavesyncConfig, file: &Path, subject: &str) -> Result<()> {
    let subject = SubjectId::parse(subject).with_context(|| format!("invalid subject: {subject}"))?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "save.bin".to_string());

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancelling upload");
            on_ctrl_c.cancel();
        }
    });

    let url = config.upload_url(subject.as_str());
    info!(file = %file.display(), %url, size = bytes.len(), "uploading save");

    let request = UploadRequest::new(url, TransferBuffer::from(bytes)).filename(filename);
    let uploader = ChunkedUploader::new(reqwest::Client::new(), config.zstd_loader());
    let outcome = uploader.upload(request, Some(&cancel), print_progress).await;
    watcher.abort();
    eprintln!();

    let receipt = match outcome {
        Ok(receipt) => receipt,
        Err(e) => {
            warn!(error = %e, retry_safe = e.is_retry_safe(), "upload failed");
            bail!("{}", e.user_message());
        }
    };

    let key = serde_json::from_slice::<serde_json::Value>(&receipt.body)
        .ok()
        .and_then(|body| body.get("key").and_then(|k| k.as_str()).map(str::to_string));
    println!(
        "Uploaded {} ({} -> {} bytes, {})",
        receipt.metadata.filename,
        receipt.metadata.original_size,
        receipt.metadata.compressed_size,
        receipt.metadata.content_type,
    );
    if let Some(key) = key {
        println!("  key = {key}");
    }
    Ok(())
}

fn print_progress(progress: UploadProgress) {
    let stage = match progress.stage {
        UploadStage::Compress => "compressing",
        UploadStage::Network => "uploading",
    };
    eprint!("\r{stage:<12} {:>3}%", progress.percent);
    let _ = std::io::stderr().flush();
}
