//! Cheap content sniffing done before compression starts.

use serde::{Deserialize, Serialize};

pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
pub const ZIP_MAGIC: [u8; 4] = *b"PK\x03\x04";

pub const ZSTD_CONTENT_TYPE: &str = "application/zstd";
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// What the input looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Already a zstd frame; passed through untouched.
    Zstd,
    /// A zip archive; already compressed, passed through untouched.
    Zip,
    /// Anything else; gets zstd-encoded.
    Binary,
}

/// Result of probing the input: its kind and the content type the
/// compressed output will carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentProbe {
    pub kind: InputKind,
    pub content_type: String,
    pub input_len: u64,
}

impl ContentProbe {
    pub fn of(input: &[u8]) -> Self {
        let kind = sniff(input);
        let content_type = match kind {
            InputKind::Zip => ZIP_CONTENT_TYPE,
            InputKind::Zstd | InputKind::Binary => ZSTD_CONTENT_TYPE,
        };
        Self {
            kind,
            content_type: content_type.to_string(),
            input_len: input.len() as u64,
        }
    }

    /// Whether compression leaves the bytes as they are.
    pub fn is_passthrough(&self) -> bool {
        matches!(self.kind, InputKind::Zstd | InputKind::Zip)
    }
}

pub fn sniff(input: &[u8]) -> InputKind {
    if input.starts_with(&ZSTD_MAGIC) {
        InputKind::Zstd
    } else if input.starts_with(&ZIP_MAGIC) {
        InputKind::Zip
    } else {
        InputKind::Binary
    }
}
