//! zstd-backed compression module.
//!
//! The input is fed to a streaming encoder in fixed-size chunks so progress
//! tracks work done rather than elapsed time. An optional dictionary is the
//! module's auxiliary data: it is read at load time, and a missing file is a
//! load failure.

use std::io::{Read, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;

use super::probe::{ContentProbe, InputKind, sniff};
use super::CompressedPayload;
use crate::module::{CompressionModule, ModuleError, ModuleLoadError, ModuleLoader, NativeHandle, NativeModule};

pub const DEFAULT_LEVEL: i32 = 7;
pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

const MODULE_NAME: &str = "zstd";

fn zstd_error(e: std::io::Error) -> ModuleError {
    ModuleError::with_code("zstd", e.to_string())
}

/// Loads a [`ZstdModule`] with the configured level and dictionary.
#[derive(Debug, Clone)]
pub struct ZstdLoader {
    level: i32,
    dictionary: Option<PathBuf>,
    chunk_size: usize,
}

impl ZstdLoader {
    pub fn new() -> Self {
        Self {
            level: DEFAULT_LEVEL,
            dictionary: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn with_dictionary(mut self, path: impl Into<PathBuf>) -> Self {
        self.dictionary = Some(path.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

impl Default for ZstdLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModuleLoader for ZstdLoader {
    type Module = ZstdModule;

    fn name(&self) -> &str {
        MODULE_NAME
    }

    async fn load(&self) -> Result<ZstdModule, ModuleLoadError> {
        let levels = zstd::compression_level_range();
        if !levels.contains(&self.level) {
            return Err(ModuleLoadError::new(
                MODULE_NAME,
                format!(
                    "compression level {} outside supported range {}..={}",
                    self.level,
                    levels.start(),
                    levels.end()
                ),
            ));
        }

        let dictionary = match &self.dictionary {
            Some(path) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    ModuleLoadError::new(
                        MODULE_NAME,
                        format!("failed to read dictionary {}: {e}", path.display()),
                    )
                })?;
                debug!(dictionary = %path.display(), size = bytes.len(), "loaded zstd dictionary");
                Some(bytes)
            }
            None => None,
        };

        Ok(ZstdModule {
            level: self.level,
            dictionary,
            chunk_size: self.chunk_size,
        })
    }
}

/// Compression context: owns the input until `compress` consumes it.
#[derive(Debug)]
pub struct CompressionContext {
    input: Vec<u8>,
    probe: ContentProbe,
    consumed: bool,
}

impl CompressionContext {
    pub fn probe(&self) -> &ContentProbe {
        &self.probe
    }
}

impl NativeHandle for CompressionContext {
    fn free(&mut self) {
        self.input = Vec::new();
    }

    fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.probe.kind,
            "content_type": self.probe.content_type,
            "input_len": self.probe.input_len,
            "consumed": self.consumed,
        })
    }
}

/// A loaded zstd compressor.
#[derive(Debug)]
pub struct ZstdModule {
    level: i32,
    dictionary: Option<Vec<u8>>,
    chunk_size: usize,
}

impl ZstdModule {
    fn encoder(&self, capacity: usize) -> Result<Encoder<'static, Vec<u8>>, ModuleError> {
        let sink = Vec::with_capacity(capacity);
        let mut encoder = match &self.dictionary {
            Some(dictionary) => Encoder::with_dictionary(sink, self.level, dictionary),
            None => Encoder::new(sink, self.level),
        }
        .map_err(zstd_error)?;
        encoder.include_checksum(true).map_err(zstd_error)?;
        Ok(encoder)
    }

    fn encode_chunked(&self, input: &[u8], progress: &mut dyn FnMut(u8)) -> Result<Vec<u8>, ModuleError> {
        let mut encoder = self.encoder(input.len() / 4)?;
        let total = input.len().div_ceil(self.chunk_size).max(1);
        let mut last = None;

        for (index, chunk) in input.chunks(self.chunk_size).enumerate() {
            encoder.write_all(chunk).map_err(zstd_error)?;
            let percent = ((index + 1) * 100 / total) as u8;
            if last != Some(percent) {
                progress(percent);
                last = Some(percent);
            }
        }
        if last.is_none() {
            progress(100);
        }

        encoder.finish().map_err(zstd_error)
    }
}

impl NativeModule for ZstdModule {
    type Handle = CompressionContext;
}

impl CompressionModule for ZstdModule {
    fn init_compression(&self, input: Vec<u8>) -> Result<(CompressionContext, ContentProbe), ModuleError> {
        let probe = ContentProbe::of(&input);
        let context = CompressionContext {
            input,
            probe: probe.clone(),
            consumed: false,
        };
        Ok((context, probe))
    }

    fn compress(
        &self,
        context: &mut CompressionContext,
        progress: &mut dyn FnMut(u8),
    ) -> Result<CompressedPayload, ModuleError> {
        if context.consumed {
            return Err(ModuleError::with_code(
                "context-consumed",
                "compression context was already consumed",
            ));
        }
        let input = std::mem::take(&mut context.input);
        context.consumed = true;

        let original_size = input.len() as u64;
        let bytes = if context.probe.is_passthrough() {
            progress(100);
            input
        } else {
            self.encode_chunked(&input, progress)?
        };

        debug!(
            kind = ?context.probe.kind,
            original_size,
            compressed_size = bytes.len(),
            "compressed payload"
        );

        Ok(CompressedPayload {
            content_type: context.probe.content_type.clone(),
            original_size,
            compressed_size: bytes.len() as u64,
            bytes,
        })
    }

    fn transform(&self, input: &[u8]) -> Result<Vec<u8>, ModuleError> {
        if sniff(input) != InputKind::Zstd {
            return Ok(input.to_vec());
        }

        let mut out = Vec::new();
        match &self.dictionary {
            Some(dictionary) => Decoder::with_dictionary(input, dictionary)
                .map_err(zstd_error)?
                .read_to_end(&mut out),
            None => Decoder::with_buffer(input).map_err(zstd_error)?.read_to_end(&mut out),
        }
        .map_err(zstd_error)?;
        Ok(out)
    }
}
