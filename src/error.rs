use thiserror::Error;

use crate::fields::Source;
use crate::identity::IdentityKind;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A descriptor lacks the fields needed to derive a canonical ID.
    #[error("identity resolution failed: {0}")]
    IdentityResolution(String),

    /// Several known identities match; queued for manual review, never guessed.
    #[error("ambiguous {kind} identity for '{name}' from {origin}: candidates {candidates:?}")]
    AmbiguousIdentity {
        kind: IdentityKind,
        origin: Source,
        name: String,
        source_ref: Option<String>,
        candidates: Vec<String>,
        review_id: Option<i64>,
    },

    /// Constraint violation or failed write; the record's transaction was rolled back.
    #[error("store write failed: {0}")]
    StoreWrite(String),

    #[error("{origin} unavailable after {attempts} attempt(s): {reason}")]
    SourceUnavailable {
        origin: Source,
        attempts: u32,
        reason: String,
    },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

impl ReconcileError {
    pub fn review_id(&self) -> Option<i64> {
        match self {
            ReconcileError::AmbiguousIdentity { review_id, .. } => *review_id,
            _ => None,
        }
    }

    pub fn needs_review(&self) -> bool {
        matches!(self, ReconcileError::AmbiguousIdentity { .. })
    }

    pub fn with_review_id(self, id: i64) -> Self {
        match self {
            ReconcileError::AmbiguousIdentity {
                kind,
                origin,
                name,
                source_ref,
                candidates,
                ..
            } => ReconcileError::AmbiguousIdentity {
                kind,
                origin,
                name,
                source_ref,
                candidates,
                review_id: Some(id),
            },
            other => other,
        }
    }
}
