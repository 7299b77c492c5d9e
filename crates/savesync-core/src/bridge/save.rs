//! Save-module operations exposed through the bridge.

use super::{BridgeError, TransferBuffer, WorkerBridge};
use crate::harness::Provenance;
use crate::module::{ModuleLoader, NativeHandle, SaveModule};

impl<L> WorkerBridge<L>
where
    L: ModuleLoader,
    L::Module: SaveModule,
{
    /// Stage bytes on the worker, replacing anything staged before.
    pub async fn stage(&self, buffer: TransferBuffer, provenance: Provenance) -> Result<(), BridgeError> {
        self.call(move |harness| {
            Box::pin(async move {
                harness.stage(buffer.into_bytes(), provenance);
                Ok(())
            })
        })
        .await
    }

    /// Move the staged bytes back to the caller.
    pub async fn take(&self) -> Result<TransferBuffer, BridgeError> {
        self.call(|harness| {
            Box::pin(async move {
                let staged = harness.take()?;
                Ok(TransferBuffer::from(staged.into_bytes()))
            })
        })
        .await
    }

    /// Size of the staged input, if any.
    pub async fn staged_len(&self) -> Result<Option<usize>, BridgeError> {
        self.call(|harness| Box::pin(async move { Ok(harness.view_staged().ok().map(|s| s.len())) }))
            .await
    }

    /// Melt the staged save. The stash is left in place so it can be parsed
    /// or melted again.
    pub async fn melt(&self) -> Result<TransferBuffer, BridgeError> {
        self.call(|harness| {
            Box::pin(async move {
                let module = harness.initialize().await?;
                let staged = harness.view_staged()?;
                let melted = module.melt(staged.bytes())?;
                Ok(TransferBuffer::from(melted))
            })
        })
        .await
    }

    /// Parse the staged save, consuming the stash, and keep the parsed
    /// handle as the active result. Returns the handle's metadata.
    pub async fn parse(&self) -> Result<serde_json::Value, BridgeError> {
        self.call(|harness| {
            Box::pin(async move {
                let module = harness.initialize().await?;
                let input = harness.take()?;
                let parsed = module.parse(input.bytes())?;
                let metadata = parsed.metadata();
                harness.set_result(parsed);
                Ok(metadata)
            })
        })
        .await
    }

    /// Stage and parse in a single worker turn, so concurrent callers
    /// cannot interleave between the two steps.
    pub async fn parse_bytes(
        &self,
        buffer: TransferBuffer,
        provenance: Provenance,
    ) -> Result<serde_json::Value, BridgeError> {
        self.call(move |harness| {
            Box::pin(async move {
                let module = harness.initialize().await?;
                harness.stage(buffer.into_bytes(), provenance);
                let input = harness.take()?;
                let parsed = module.parse(input.bytes())?;
                let metadata = parsed.metadata();
                harness.set_result(parsed);
                Ok(metadata)
            })
        })
        .await
    }

    /// Metadata of the active parsed save.
    pub async fn metadata(&self) -> Result<serde_json::Value, BridgeError> {
        self.call(|harness| Box::pin(async move { Ok(harness.result()?.metadata()) }))
            .await
    }

    /// Install a replacement token table on the loaded module.
    pub async fn set_tokens(&self, tokens: TransferBuffer) -> Result<(), BridgeError> {
        self.call(move |harness| {
            Box::pin(async move {
                let module = harness.initialize().await?;
                module.set_tokens(tokens.as_slice())?;
                Ok(())
            })
        })
        .await
    }
}
