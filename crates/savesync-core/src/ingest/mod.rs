//! Server-side ingestion: store and validate concurrently, then commit and
//! notify, or compensate.
//!
//! ```text
//! ingest(subject, bytes)
//!   ├── put(key, bytes)        (spawned, tracked)
//!   └── validate(bytes)        (in the caller's task)
//!         ├─ accepted ──> await put ──> commit ──> broadcast (tracked)
//!         ├─ rejected ──> await put ──> delete(key) ──> ValidationRejected
//!         └─ put failed first ──> Storage (nothing to compensate)
//! ```
//!
//! A stored key is only deleted after its `put` has finished, so a delete
//! can never race an in-flight write.
//!
//! Overlapping ingestions for the same subject are not ordered against each
//! other: whichever commits last becomes current. Set
//! [`IngestConfig::serialize_per_subject`] to queue them instead.

pub mod artifact;
pub mod room;
pub mod store;
pub mod validate;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub use artifact::{ArtifactKey, ArtifactState, LiveArtifact, SubjectError, SubjectId};
pub use room::{LiveMessage, Recipients, Rooms, Subscription};
pub use store::{ArtifactStore, FsArtifactStore, MemoryArtifactStore, StoreError, StoredObject};
pub use validate::{BridgeValidator, HttpValidator, ValidationOutcome, Validator, ValidatorError};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to store artifact {key}: {source}")]
    Storage {
        key: ArtifactKey,
        #[source]
        source: StoreError,
    },

    #[error("save rejected: {reason}")]
    ValidationRejected { reason: String, code: String },

    #[error("validator unavailable: {0}")]
    ValidatorUnavailable(#[source] ValidatorError),

    #[error("failed to roll back artifact {key}: {source}")]
    CompensationFailed {
        key: ArtifactKey,
        #[source]
        source: StoreError,
    },

    #[error("invalid artifact transition {from} -> {to}")]
    InvalidTransition { from: ArtifactState, to: ArtifactState },
}

impl IngestError {
    /// Machine-readable rejection code, for rejections only.
    pub fn rejection_code(&self) -> Option<&str> {
        match self {
            IngestError::ValidationRejected { code, .. } => Some(code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestConfig {
    /// Queue ingestions for the same subject instead of letting them
    /// overlap.
    pub serialize_per_subject: bool,
}

/// One upload handed to [`IngestionActor::ingest`].
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub subject: SubjectId,
    pub bytes: Bytes,
    pub content_type: String,
    pub metadata: serde_json::Value,
}

impl IngestRequest {
    pub fn new(subject: SubjectId, bytes: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            subject,
            bytes,
            content_type: content_type.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Default)]
struct SubjectState {
    current: Option<LiveArtifact>,
    history: Vec<LiveArtifact>,
    in_flight: usize,
    writer: Arc<tokio::sync::Mutex<()>>,
}

type SharedSubject = Arc<Mutex<SubjectState>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Subjects = Mutex<HashMap<SubjectId, SharedSubject>>;

/// Decrements the subject's in-flight count when an ingestion ends, however
/// it ends, and forgets the subject if nothing was ever committed for it.
struct InFlight<'a> {
    subjects: &'a Subjects,
    subject: SubjectId,
    state: SharedSubject,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut subjects = lock(self.subjects);
        let idle = {
            let mut state = lock(&self.state);
            state.in_flight = state.in_flight.saturating_sub(1);
            state.in_flight == 0 && state.current.is_none()
        };
        if idle && subjects.get(&self.subject).is_some_and(|s| Arc::ptr_eq(s, &self.state)) {
            subjects.remove(&self.subject);
            debug!(subject = %self.subject, "dropped state for subject with no committed save");
        }
    }
}

/// Per-subject ingestion broker.
pub struct IngestionActor {
    store: Arc<dyn ArtifactStore>,
    validator: Arc<dyn Validator>,
    rooms: Rooms,
    subjects: Subjects,
    tracker: TaskTracker,
    config: IngestConfig,
}

impl IngestionActor {
    pub fn new(store: Arc<dyn ArtifactStore>, validator: Arc<dyn Validator>) -> Self {
        Self::with_config(store, validator, IngestConfig::default())
    }

    pub fn with_config(store: Arc<dyn ArtifactStore>, validator: Arc<dyn Validator>, config: IngestConfig) -> Self {
        Self {
            store,
            validator,
            rooms: Rooms::new(),
            subjects: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Run one ingestion to its terminal state.
    ///
    /// On `Ok` the artifact is committed and a broadcast to the subject's
    /// current subscribers has been scheduled. On `ValidationRejected` or
    /// `ValidatorUnavailable` the stored object has already been deleted.
    ///
    /// Dropping this future after the write has started skips compensation
    /// and can leave an uncommitted object in the store. Callers that may go
    /// away mid-ingestion (request handlers) should use
    /// [`IngestionActor::ingest_tracked`].
    pub async fn ingest(&self, request: IngestRequest) -> Result<LiveArtifact, IngestError> {
        let IngestRequest {
            subject,
            bytes,
            content_type,
            metadata,
        } = request;

        let (state, overlapping) = self.enter_subject(&subject);
        let _in_flight = InFlight {
            subjects: &self.subjects,
            subject: subject.clone(),
            state: Arc::clone(&state),
        };
        let _writer = if self.config.serialize_per_subject {
            let writer = Arc::clone(&lock(&state).writer);
            Some(writer.lock_owned().await)
        } else {
            None
        };

        if overlapping > 0 && !self.config.serialize_per_subject {
            warn!(
                subject = %subject,
                overlapping,
                "overlapping ingestions for subject; the last to commit becomes current"
            );
        }

        let key = ArtifactKey::generate(subject.clone());
        let mut artifact = LiveArtifact::uploading(key.clone(), content_type.clone(), bytes.len() as u64, metadata);
        info!(key = %key, size = artifact.size, content_type = %content_type, "ingesting artifact");

        let verdict = match self.store_and_validate(&key, bytes, &content_type).await {
            Ok(verdict) => verdict,
            Err(source) => {
                error!(key = %key, error = %source, "storing artifact failed");
                return Err(IngestError::Storage { key, source });
            }
        };
        advance(&mut artifact, ArtifactState::Stored)?;

        match verdict {
            Ok(ValidationOutcome::Accepted { summary }) => {
                advance(&mut artifact, ArtifactState::Validated)?;
                artifact.summary = Some(summary);
                advance(&mut artifact, ArtifactState::Committed)?;
                self.commit(&state, &artifact);
                Ok(artifact)
            }
            Ok(ValidationOutcome::Rejected { reason, code }) => {
                info!(key = %key, code = %code, reason = %reason, "artifact rejected by validator");
                self.roll_back(&mut artifact).await?;
                Err(IngestError::ValidationRejected { reason, code })
            }
            Err(e) => {
                warn!(key = %key, error = %e, "validator unavailable; rolling back");
                self.roll_back(&mut artifact).await?;
                Err(IngestError::ValidatorUnavailable(e))
            }
        }
    }

    /// Like [`IngestionActor::ingest`], but the pipeline runs on a tracked
    /// task, so it reaches a terminal state even if the caller goes away.
    pub fn ingest_tracked(self: &Arc<Self>, request: IngestRequest) -> JoinHandle<Result<LiveArtifact, IngestError>> {
        let actor = Arc::clone(self);
        self.tracker.spawn(async move { actor.ingest(request).await })
    }

    /// Join `subject`'s room. Only commits after this call are delivered;
    /// use [`IngestionActor::current`] to catch up.
    pub fn subscribe(&self, subject: SubjectId) -> Subscription {
        self.rooms.join(subject)
    }

    /// Send an `updated` message for `key` to the subject's current
    /// subscribers. Returns how many received it.
    pub fn notify(&self, subject: &SubjectId, key: &ArtifactKey) -> usize {
        self.rooms.snapshot(subject).deliver(&LiveMessage::Updated { key: key.clone() })
    }

    pub fn current(&self, subject: &SubjectId) -> Option<LiveArtifact> {
        self.existing_subject(subject)
            .and_then(|state| lock(&state).current.clone())
    }

    /// Committed artifacts for `subject`, oldest first.
    pub fn history(&self, subject: &SubjectId) -> Vec<LiveArtifact> {
        self.existing_subject(subject)
            .map(|state| lock(&state).history.clone())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, subject: &SubjectId) -> usize {
        self.rooms.member_count(subject)
    }

    /// Stop accepting tracked work and wait for pending writes, ingestions
    /// and broadcasts to finish.
    pub async fn shutdown(&self) {
        self.tracker.close();
        debug!(pending = self.tracker.len(), "waiting for tracked ingestion tasks");
        self.tracker.wait().await;
        info!("ingestion actor drained");
    }

    // -----------------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------------

    /// Start the write on its own task and validate concurrently.
    ///
    /// Returns the validation verdict once the write has finished. A failed
    /// write wins over any verdict.
    async fn store_and_validate(
        &self,
        key: &ArtifactKey,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<Result<ValidationOutcome, ValidatorError>, StoreError> {
        let store = Arc::clone(&self.store);
        let put_key = key.clone();
        let put_bytes = bytes.clone();
        let put_type = content_type.to_string();
        let mut storing = self
            .tracker
            .spawn(async move { store.put(&put_key, put_bytes, &put_type).await });

        let validating = self.validator.validate(bytes, content_type);
        tokio::pin!(validating);

        let mut stored = false;
        let verdict = loop {
            tokio::select! {
                result = &mut storing, if !stored => {
                    flatten_join(result)?;
                    stored = true;
                    debug!(key = %key, "artifact stored; waiting for validation");
                }
                outcome = &mut validating => break outcome,
            }
        };

        if !stored {
            if !matches!(verdict, Ok(ValidationOutcome::Accepted { .. })) {
                debug!(key = %key, "validation failed before storage finished; waiting to compensate");
            }
            flatten_join(storing.await)?;
        }
        Ok(verdict)
    }

    fn commit(&self, state: &SharedSubject, artifact: &LiveArtifact) {
        {
            let mut s = lock(state);
            s.history.push(artifact.clone());
            s.current = Some(artifact.clone());
        }

        let recipients = self.rooms.snapshot(&artifact.subject);
        info!(
            key = %artifact.key,
            subscribers = recipients.len(),
            "artifact committed"
        );

        let message = LiveMessage::Updated {
            key: artifact.key.clone(),
        };
        self.tracker.spawn(async move {
            recipients.deliver(&message);
        });
    }

    async fn roll_back(&self, artifact: &mut LiveArtifact) -> Result<(), IngestError> {
        let key = artifact.key.clone();
        if let Err(source) = self.store.delete(&key).await {
            error!(key = %key, error = %source, "compensating delete failed; artifact orphaned");
            return Err(IngestError::CompensationFailed { key, source });
        }
        advance(artifact, ArtifactState::RolledBack)?;
        info!(key = %key, "artifact rolled back");
        Ok(())
    }

    /// Look up (or create) the subject's state and count this ingestion as
    /// in flight under the map lock, so pruning never races a new arrival.
    /// Returns the number of ingestions already in flight.
    fn enter_subject(&self, subject: &SubjectId) -> (SharedSubject, usize) {
        let mut subjects = lock(&self.subjects);
        let state = Arc::clone(subjects.entry(subject.clone()).or_default());
        let overlapping = {
            let mut s = lock(&state);
            s.in_flight += 1;
            s.in_flight - 1
        };
        (state, overlapping)
    }

    fn existing_subject(&self, subject: &SubjectId) -> Option<SharedSubject> {
        lock(&self.subjects).get(subject).cloned()
    }
}

impl std::fmt::Debug for IngestionActor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionActor")
            .field("store", &self.store.name())
            .field("rooms", &self.rooms)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn advance(artifact: &mut LiveArtifact, to: ArtifactState) -> Result<(), IngestError> {
    artifact
        .transition(to)
        .map_err(|(from, to)| IngestError::InvalidTransition { from, to })
}

fn flatten_join(result: Result<Result<(), StoreError>, tokio::task::JoinError>) -> Result<(), StoreError> {
    result.unwrap_or_else(|e| Err(StoreError::Backend(format!("store task failed: {e}"))))
}
