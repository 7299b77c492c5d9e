//! Independent validation of uploaded saves.
//!
//! Validators answer `{ ok: true, summary }` or `{ ok: false, reason, code }`.
//! A rejection is an expected business outcome; only a validator that cannot
//! answer at all produces a [`ValidatorError`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bridge::{BridgeClient, BridgeError, TransferBuffer};
use crate::harness::{HarnessError, Provenance};
use crate::module::{ModuleError, ModuleLoader, SaveModule};

/// Code used when a module rejects input without giving a reason code.
pub const UNSPECIFIED_REJECTION: &str = "invalid-save";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireOutcome", into = "WireOutcome")]
pub enum ValidationOutcome {
    Accepted { summary: serde_json::Value },
    Rejected { reason: String, code: String },
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted { .. })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireOutcome {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

impl TryFrom<WireOutcome> for ValidationOutcome {
    type Error = String;

    fn try_from(wire: WireOutcome) -> Result<Self, Self::Error> {
        if wire.ok {
            return Ok(ValidationOutcome::Accepted {
                summary: wire.summary.unwrap_or(serde_json::Value::Null),
            });
        }
        let reason = wire.reason.ok_or("rejection without a reason")?;
        Ok(ValidationOutcome::Rejected {
            reason,
            code: wire.code.unwrap_or_else(|| UNSPECIFIED_REJECTION.to_string()),
        })
    }
}

impl From<ValidationOutcome> for WireOutcome {
    fn from(outcome: ValidationOutcome) -> Self {
        match outcome {
            ValidationOutcome::Accepted { summary } => WireOutcome {
                ok: true,
                summary: Some(summary),
                reason: None,
                code: None,
            },
            ValidationOutcome::Rejected { reason, code } => WireOutcome {
                ok: false,
                summary: None,
                reason: Some(reason),
                code: Some(code),
            },
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidatorError {
    #[error("validator unreachable: {0}")]
    Transport(String),

    #[error("validator returned an unusable response: {0}")]
    Protocol(String),

    #[error("validator worker failed: {0}")]
    Worker(String),
}

#[async_trait]
pub trait Validator: Send + Sync + 'static {
    async fn validate(&self, bytes: Bytes, content_type: &str) -> Result<ValidationOutcome, ValidatorError>;
}

// ---------------------------------------------------------------------------
// Remote HTTP validator
// ---------------------------------------------------------------------------

/// POSTs the raw bytes to a remote parse service.
#[derive(Debug, Clone)]
pub struct HttpValidator {
    client: reqwest::Client,
    url: String,
}

impl HttpValidator {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Validator for HttpValidator {
    async fn validate(&self, bytes: Bytes, content_type: &str) -> Result<ValidationOutcome, ValidatorError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await
            .map_err(|e| ValidatorError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| ValidatorError::Transport(e.to_string()))?;

        // Rejections may come back with a 4xx; the body decides.
        match serde_json::from_slice::<ValidationOutcome>(&body) {
            Ok(outcome) => {
                debug!(status = status.as_u16(), accepted = outcome.is_accepted(), "validator answered");
                Ok(outcome)
            }
            Err(e) => Err(ValidatorError::Protocol(format!(
                "status {}: {e}",
                status.as_u16()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// In-process validator backed by a save module
// ---------------------------------------------------------------------------

/// Validates by parsing on a worker-hosted save module. Module errors are
/// rejections; bridge failures mean the validator is unavailable.
pub struct BridgeValidator<L: ModuleLoader + Clone> {
    client: Arc<BridgeClient<L>>,
}

impl<L> BridgeValidator<L>
where
    L: ModuleLoader + Clone,
    L::Module: SaveModule,
{
    pub fn new(client: Arc<BridgeClient<L>>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<L> Validator for BridgeValidator<L>
where
    L: ModuleLoader + Clone,
    L::Module: SaveModule,
{
    async fn validate(&self, bytes: Bytes, _content_type: &str) -> Result<ValidationOutcome, ValidatorError> {
        let bridge = self
            .client
            .get()
            .await
            .map_err(|e| ValidatorError::Worker(e.to_string()))?;

        match bridge
            .parse_bytes(TransferBuffer::from(bytes), Provenance::RemoteUrl)
            .await
        {
            Ok(summary) => Ok(ValidationOutcome::Accepted { summary }),
            Err(BridgeError::Harness(HarnessError::Module(ModuleError { code, message }))) => {
                Ok(ValidationOutcome::Rejected {
                    reason: message,
                    code: code.unwrap_or_else(|| UNSPECIFIED_REJECTION.to_string()),
                })
            }
            Err(e) => Err(ValidatorError::Worker(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_parses_both_shapes() {
        let ok: ValidationOutcome =
            serde_json::from_str(r#"{"ok":true,"summary":{"date":"1444.11.11"}}"#).unwrap();
        assert_eq!(
            ok,
            ValidationOutcome::Accepted {
                summary: serde_json::json!({"date": "1444.11.11"})
            }
        );

        let rejected: ValidationOutcome =
            serde_json::from_str(r#"{"ok":false,"reason":"unsupported version 1.20","code":"unsupported-patch"}"#)
                .unwrap();
        assert_eq!(
            rejected,
            ValidationOutcome::Rejected {
                reason: "unsupported version 1.20".into(),
                code: "unsupported-patch".into(),
            }
        );
    }

    #[test]
    fn rejection_without_code_gets_default() {
        let rejected: ValidationOutcome = serde_json::from_str(r#"{"ok":false,"reason":"nope"}"#).unwrap();
        assert_eq!(
            rejected,
            ValidationOutcome::Rejected {
                reason: "nope".into(),
                code: UNSPECIFIED_REJECTION.into(),
            }
        );
    }

    #[test]
    fn rejection_without_reason_is_malformed() {
        assert!(serde_json::from_str::<ValidationOutcome>(r#"{"ok":false}"#).is_err());
    }

    #[test]
    fn serializes_to_wire_shape() {
        let json = serde_json::to_value(ValidationOutcome::Rejected {
            reason: "r".into(),
            code: "c".into(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"ok": false, "reason": "r", "code": "c"}));
    }
}
