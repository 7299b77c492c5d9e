//! Durable artifact storage.
//!
//! `put` and `delete` are idempotent from the caller's point of view:
//! deleting a missing key succeeds.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::artifact::{ArtifactKey, SubjectId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("artifact {0} not found")]
    NotFound(String),

    #[error("artifact store I/O failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt sidecar for {key}: {message}")]
    Corrupt { key: String, message: String },

    #[error("artifact store failed: {0}")]
    Backend(String),
}

impl StoreError {
    fn io(key: &ArtifactKey, source: std::io::Error) -> Self {
        StoreError::Io {
            key: key.to_string(),
            source,
        }
    }
}

/// Bytes plus the content type they were stored with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Bytes,
    pub content_type: String,
}

#[async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn put(&self, key: &ArtifactKey, bytes: Bytes, content_type: &str) -> Result<(), StoreError>;

    async fn delete(&self, key: &ArtifactKey) -> Result<(), StoreError>;

    async fn get(&self, key: &ArtifactKey) -> Result<StoredObject, StoreError>;

    async fn list(&self, subject: &SubjectId) -> Result<Vec<ArtifactKey>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<ArtifactKey, StoredObject>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ArtifactKey, StoredObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(&self, key: &ArtifactKey, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.lock().insert(
            key.clone(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<StoredObject, StoreError> {
        self.lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, subject: &SubjectId) -> Result<Vec<ArtifactKey>, StoreError> {
        Ok(self
            .lock()
            .keys()
            .filter(|key| key.subject() == subject)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    size: u64,
}

/// Stores each artifact as `<root>/<subject>/<id>.bin` with a JSON sidecar
/// `<id>.json`. Writes go to a temp file first and are renamed into place,
/// so a reader never sees a partial object.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.subject().as_str())
            .join(format!("{}.bin", key.id()))
    }

    fn sidecar_path(&self, key: &ArtifactKey) -> PathBuf {
        self.root
            .join(key.subject().as_str())
            .join(format!("{}.json", key.id()))
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp, contents).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    tokio::fs::rename(&tmp, path).await
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn put(&self, key: &ArtifactKey, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        let dir = self.root.join(key.subject().as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(key, e))?;

        let sidecar = Sidecar {
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
        };
        let sidecar = serde_json::to_vec(&sidecar).map_err(|e| StoreError::Backend(e.to_string()))?;

        // Sidecar first: an object file on disk always has its metadata.
        write_atomic(&self.sidecar_path(key), &sidecar)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        write_atomic(&self.object_path(key), &bytes)
            .await
            .map_err(|e| StoreError::io(key, e))?;

        debug!(key = %key, size = bytes.len(), "artifact written");
        Ok(())
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<(), StoreError> {
        remove_if_exists(&self.object_path(key))
            .await
            .map_err(|e| StoreError::io(key, e))?;
        remove_if_exists(&self.sidecar_path(key))
            .await
            .map_err(|e| StoreError::io(key, e))?;
        debug!(key = %key, "artifact deleted");
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<StoredObject, StoreError> {
        let bytes = match tokio::fs::read(self.object_path(key)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::NotFound(key.to_string())),
            Err(e) => return Err(StoreError::io(key, e)),
        };
        let sidecar = tokio::fs::read(self.sidecar_path(key))
            .await
            .map_err(|e| StoreError::io(key, e))?;
        let sidecar: Sidecar = serde_json::from_slice(&sidecar).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        Ok(StoredObject {
            bytes: Bytes::from(bytes),
            content_type: sidecar.content_type,
        })
    }

    async fn list(&self, subject: &SubjectId) -> Result<Vec<ArtifactKey>, StoreError> {
        let dir = self.root.join(subject.as_str());
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Io {
                    key: subject.to_string(),
                    source: e,
                });
            }
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::Io {
            key: subject.to_string(),
            source: e,
        })? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("bin") {
                continue;
            }
            let id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Uuid::parse_str(stem).ok());
            if let Some(id) = id {
                keys.push(ArtifactKey::new(subject.clone(), id));
            }
        }
        Ok(keys)
    }
}
