use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use savesync_core::ingest::{ArtifactKey, ArtifactStore, MemoryArtifactStore, StoreError, StoredObject, SubjectId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    PutStarted(ArtifactKey),
    PutFinished(ArtifactKey),
    Deleted(ArtifactKey),
}

/// In-memory store with an event log, an optional write delay and switches
/// to make writes or deletes fail.
#[derive(Debug, Default)]
pub struct RecordingStore {
    inner: MemoryArtifactStore,
    events: Mutex<Vec<StoreEvent>>,
    put_delay: Duration,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn objects(&self) -> &MemoryArtifactStore {
        &self.inner
    }

    fn record(&self, event: StoreEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ArtifactStore for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    async fn put(&self, key: &ArtifactKey, bytes: Bytes, content_type: &str) -> Result<(), StoreError> {
        self.record(StoreEvent::PutStarted(key.clone()));
        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.put(key, bytes, content_type).await?;
        self.record(StoreEvent::PutFinished(key.clone()));
        Ok(())
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<(), StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("delete refused".to_string()));
        }
        self.inner.delete(key).await?;
        self.record(StoreEvent::Deleted(key.clone()));
        Ok(())
    }

    async fn get(&self, key: &ArtifactKey) -> Result<StoredObject, StoreError> {
        self.inner.get(key).await
    }

    async fn list(&self, subject: &SubjectId) -> Result<Vec<ArtifactKey>, StoreError> {
        self.inner.list(subject).await
    }
}
