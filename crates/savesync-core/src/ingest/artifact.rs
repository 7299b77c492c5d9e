//! Subjects, artifact keys and the per-artifact lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_SUBJECT_LEN: usize = 128;

/// Errors from parsing a subject id or artifact key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectError {
    #[error("subject id must not be empty")]
    Empty,

    #[error("subject id is longer than {MAX_SUBJECT_LEN} characters")]
    TooLong,

    #[error("subject id contains invalid character {0:?}")]
    InvalidChar(char),

    #[error("invalid artifact key: {0}")]
    InvalidKey(String),
}

/// The identity (e.g. a user) that owns artifacts and subscriber rooms.
///
/// Restricted to `[A-Za-z0-9_-]{1,128}` so keys built from it never collide
/// across subjects or escape a store directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    pub fn parse(raw: &str) -> Result<Self, SubjectError> {
        if raw.is_empty() {
            return Err(SubjectError::Empty);
        }
        if raw.len() > MAX_SUBJECT_LEN {
            return Err(SubjectError::TooLong);
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(SubjectError::InvalidChar(bad));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SubjectId {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SubjectId {
    type Error = SubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SubjectId> for String {
    fn from(value: SubjectId) -> Self {
        value.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage key of one artifact: `{subject}/{artifact_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    subject: SubjectId,
    id: Uuid,
}

impl ArtifactKey {
    pub fn new(subject: SubjectId, id: Uuid) -> Self {
        Self { subject, id }
    }

    /// Allocate a key for a fresh upload.
    pub fn generate(subject: SubjectId) -> Self {
        Self::new(subject, Uuid::new_v4())
    }

    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject, self.id)
    }
}

impl FromStr for ArtifactKey {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (subject, id) = s
            .split_once('/')
            .ok_or_else(|| SubjectError::InvalidKey(s.to_string()))?;
        let id = Uuid::parse_str(id).map_err(|_| SubjectError::InvalidKey(s.to_string()))?;
        Ok(Self::new(SubjectId::parse(subject)?, id))
    }
}

impl Serialize for ArtifactKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ArtifactKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle of one uploaded artifact.
///
/// ```text
/// Uploading -> Stored -> Validated -> Committed
///                 \
///                  +--> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Uploading,
    Stored,
    Validated,
    Committed,
    RolledBack,
}

impl ArtifactState {
    pub fn is_valid_transition(self, to: ArtifactState) -> bool {
        use ArtifactState::*;
        matches!(
            (self, to),
            (Uploading, Stored) | (Stored, Validated) | (Stored, RolledBack) | (Validated, Committed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ArtifactState::Committed | ArtifactState::RolledBack)
    }
}

impl fmt::Display for ArtifactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactState::Uploading => "uploading",
            ArtifactState::Stored => "stored",
            ArtifactState::Validated => "validated",
            ArtifactState::Committed => "committed",
            ArtifactState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// An uploaded artifact and what happened to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveArtifact {
    pub key: ArtifactKey,
    pub subject: SubjectId,
    pub state: ArtifactState,
    pub content_type: String,
    pub size: u64,
    /// Sender-declared metadata, kept verbatim.
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Validator summary, once validated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

impl LiveArtifact {
    pub fn uploading(key: ArtifactKey, content_type: String, size: u64, metadata: serde_json::Value) -> Self {
        Self {
            subject: key.subject().clone(),
            key,
            state: ArtifactState::Uploading,
            content_type,
            size,
            metadata,
            summary: None,
            created_at: Utc::now(),
            committed_at: None,
        }
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: ArtifactState) -> Result<(), (ArtifactState, ArtifactState)> {
        if !self.state.is_valid_transition(to) {
            return Err((self.state, to));
        }
        self.state = to;
        if to == ArtifactState::Committed {
            self.committed_at = Some(Utc::now());
        }
        Ok(())
    }
}
