use std::path::Path;

use anyhow::{Context, Result};

use savesync_core::bridge::{BridgeOptions, TransferBuffer};
use savesync_core::compression::{CompressionPipeline, ZstdLoader};

/// Execute `savesync transform`: re-emit a stored artifact (decoding zstd,
/// passing anything else through) into `output`.
pub async fn run_transform(loader: ZstdLoader, input: &Path, output: &Path) -> Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("failed to read {}", input.display()))?;
    let input_len = bytes.len();

    let pipeline =
        CompressionPipeline::spawn(loader, BridgeOptions::named("transform")).context("failed to start transform worker")?;
    let outcome = pipeline.transform(TransferBuffer::from(bytes)).await;
    pipeline.release().await;
    let restored = outcome.context("transform failed")?;

    let output_len = restored.len();
    tokio::fs::write(output, restored.as_slice())
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Wrote {} ({input_len} -> {output_len} bytes)", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transform_decodes_a_stored_artifact() {
        let tmp = tempfile::TempDir::new().unwrap();
        let input = tmp.path().join("save.zst");
        let output = tmp.path().join("save.eu4");
        let original = b"EU4txt date=1444.11.11\n".repeat(100);
        std::fs::write(&input, zstd::encode_all(&original[..], 3).unwrap()).unwrap();

        run_transform(ZstdLoader::new(), &input, &output).await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), original);
    }

    #[tokio::test]
    async fn transform_passes_zip_through() {
        let tmp = tempfile::TempDir::new().unwrap();
        let input = tmp.path().join("save.zip");
        let output = tmp.path().join("copy.zip");
        let zip = b"PK\x03\x04not really an archive".to_vec();
        std::fs::write(&input, &zip).unwrap();

        run_transform(ZstdLoader::new(), &input, &output).await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), zip);
    }

    #[tokio::test]
    async fn missing_input_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = run_transform(ZstdLoader::new(), &tmp.path().join("nope"), &tmp.path().join("out"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("failed to read"), "unexpected error: {err:#}");
    }
}
