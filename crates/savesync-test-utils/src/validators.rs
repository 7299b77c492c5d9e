use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use savesync_core::ingest::{ValidationOutcome, Validator, ValidatorError};
use tokio::sync::watch;

/// Always answers with the same outcome.
#[derive(Debug, Clone)]
pub struct StaticValidator {
    outcome: ValidationOutcome,
}

impl StaticValidator {
    pub fn accepting() -> Self {
        Self {
            outcome: ValidationOutcome::Accepted {
                summary: serde_json::json!({ "valid": true }),
            },
        }
    }

    pub fn rejecting(code: &str, reason: &str) -> Self {
        Self {
            outcome: ValidationOutcome::Rejected {
                reason: reason.to_string(),
                code: code.to_string(),
            },
        }
    }
}

#[async_trait]
impl Validator for StaticValidator {
    async fn validate(&self, _bytes: Bytes, _content_type: &str) -> Result<ValidationOutcome, ValidatorError> {
        Ok(self.outcome.clone())
    }
}

/// Cannot be reached.
#[derive(Debug, Clone, Default)]
pub struct UnreachableValidator;

#[async_trait]
impl Validator for UnreachableValidator {
    async fn validate(&self, _bytes: Bytes, _content_type: &str) -> Result<ValidationOutcome, ValidatorError> {
        Err(ValidatorError::Transport("connection refused".to_string()))
    }
}

/// Holds every validation until [`GatedValidator::open`] is called.
#[derive(Debug, Clone)]
pub struct GatedValidator {
    outcome: ValidationOutcome,
    gate: Arc<watch::Sender<bool>>,
    started: Arc<AtomicUsize>,
    finished: Arc<AtomicUsize>,
}

impl GatedValidator {
    pub fn new(outcome: ValidationOutcome) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            outcome,
            gate: Arc::new(gate),
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Validator for GatedValidator {
    async fn validate(&self, _bytes: Bytes, _content_type: &str) -> Result<ValidationOutcome, ValidatorError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.gate.subscribe();
        rx.wait_for(|open| *open)
            .await
            .map_err(|e| ValidatorError::Transport(e.to_string()))?;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}
