//! Staged input bytes awaiting a single consuming operation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Where staged bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    LocalFile,
    RemoteUrl,
    FilesystemHandle,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Provenance::LocalFile => "local-file",
            Provenance::RemoteUrl => "remote-url",
            Provenance::FilesystemHandle => "filesystem-handle",
        };
        f.write_str(s)
    }
}

/// Raw bytes plus provenance. Plain heap memory, so dropping it is enough.
#[derive(Debug, PartialEq, Eq)]
pub struct StagedInput {
    bytes: Bytes,
    provenance: Provenance,
}

impl StagedInput {
    pub fn new(bytes: impl Into<Bytes>, provenance: Provenance) -> Self {
        Self {
            bytes: bytes.into(),
            provenance,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provenance_display_matches_serde() {
        for p in [
            Provenance::LocalFile,
            Provenance::RemoteUrl,
            Provenance::FilesystemHandle,
        ] {
            let json = serde_json::to_string(&p).unwrap();
            assert_eq!(json, format!("\"{p}\""));
        }
    }
}
