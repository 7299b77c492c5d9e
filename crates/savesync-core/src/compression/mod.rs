//! Two-stage compression running behind a [`WorkerBridge`].
//!
//! `initialize_compression` hands the input to the worker and installs the
//! compression context as the harness's active result. `compress` then
//! consumes that context with chunk-based progress. `transform` is a
//! separate stateless re-encoding used when serving stored artifacts.
//!
//! Output is not guaranteed to be smaller than the input, so
//! [`CompressedPayload`] always records both sizes.

pub mod probe;
pub mod zstd_codec;

use crate::bridge::{BridgeError, BridgeOptions, BridgeState, TransferBuffer, WorkerBridge};
use crate::module::{CompressionModule, ModuleLoader};

pub use probe::{ContentProbe, InputKind, sniff};
pub use zstd_codec::{CompressionContext, ZstdLoader, ZstdModule};

/// Compressed bytes plus the sizes and content type they were produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedPayload {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub original_size: u64,
    pub compressed_size: u64,
}

impl CompressedPayload {
    pub fn grew(&self) -> bool {
        self.compressed_size > self.original_size
    }

    pub fn into_transfer(self) -> TransferBuffer {
        TransferBuffer::from(self.bytes)
    }
}

/// Compression module driven on its own worker thread.
pub struct CompressionPipeline<L: ModuleLoader = ZstdLoader> {
    bridge: WorkerBridge<L>,
}

impl<L> CompressionPipeline<L>
where
    L: ModuleLoader,
    L::Module: CompressionModule,
{
    pub fn spawn(loader: L, options: BridgeOptions) -> Result<Self, BridgeError> {
        Ok(Self {
            bridge: WorkerBridge::spawn(loader, options)?,
        })
    }

    /// Move `input` to the worker and prepare a compression context for it.
    /// Any previous context is freed first.
    pub async fn initialize_compression(&self, input: TransferBuffer) -> Result<ContentProbe, BridgeError> {
        self.bridge
            .call(move |harness| {
                Box::pin(async move {
                    let module = harness.initialize().await?;
                    let (context, probe) = module.init_compression(input.into_vec())?;
                    harness.set_result(context);
                    Ok(probe)
                })
            })
            .await
    }

    /// Compress the prepared context. `on_progress` receives 0..=100 as
    /// chunks are processed and always sees 100 before this returns `Ok`.
    pub async fn compress<C>(&self, on_progress: C) -> Result<CompressedPayload, BridgeError>
    where
        C: FnMut(u8),
    {
        self.bridge
            .call_with_progress(
                |harness, progress| {
                    Box::pin(async move {
                        let module = harness.initialize().await?;
                        let context = harness.result_mut()?;
                        let payload = module.compress(context.get_mut(), &mut |percent| progress.report(percent))?;
                        Ok(payload)
                    })
                },
                on_progress,
            )
            .await
    }

    /// `initialize_compression` followed by `compress`.
    pub async fn run<C>(&self, input: TransferBuffer, on_progress: C) -> Result<(ContentProbe, CompressedPayload), BridgeError>
    where
        C: FnMut(u8),
    {
        let probe = self.initialize_compression(input).await?;
        let payload = self.compress(on_progress).await?;
        Ok((probe, payload))
    }

    /// Stateless one-shot re-encoding. Does not touch the active context.
    pub async fn transform(&self, input: TransferBuffer) -> Result<TransferBuffer, BridgeError> {
        self.bridge
            .call(move |harness| {
                Box::pin(async move {
                    let module = harness.initialize().await?;
                    let output = module.transform(input.as_slice())?;
                    Ok(TransferBuffer::from(output))
                })
            })
            .await
    }

    pub fn state(&self) -> BridgeState {
        self.bridge.state()
    }

    pub fn bridge(&self) -> &WorkerBridge<L> {
        &self.bridge
    }

    /// Tear down the worker. Idempotent.
    pub async fn release(&self) {
        self.bridge.release().await;
    }
}

impl<L: ModuleLoader> std::fmt::Debug for CompressionPipeline<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionPipeline")
            .field("bridge", &self.bridge)
            .finish()
    }
}
