//! Unified error handling for tssd.
//!
//! Engine operations fail with [`EngineError`]; callers branch on the variant
//! to decide between reject, retry, or extend/append flows. Storage-level
//! failures live in [`crate::db::DbError`] and are wrapped here.

use crate::db::DbError;
use thiserror::Error;

/// Errors surfaced by the moderation engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input, rejected before any write.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced guild, user, case, or incident does not exist.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// The operation would violate a uniqueness rule (duplicate active mute,
    /// duplicate open incident). Callers may choose to extend instead.
    #[error("conflict: {0}")]
    Conflict(&'static str),

    /// The actor's role set holds no grant for the required capability.
    #[error("capability denied: {capability}")]
    AuthorizationDenied { capability: &'static str },

    /// A registry key already exists with a different kind.
    #[error("resource {key:?} is registered as {have}, not {want}")]
    KindMismatch {
        key: String,
        have: String,
        want: String,
    },

    /// Storage failure. Transient variants are safe to retry: point
    /// operations are atomic and sweeps are idempotent.
    #[error("database error: {0}")]
    Db(DbError),
}

impl EngineError {
    /// Stable error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::KindMismatch { .. } => "kind_mismatch",
            Self::Db(_) => "db",
        }
    }
}

impl From<DbError> for EngineError {
    fn from(err: DbError) -> Self {
        match err {
            // Foreign-key misses mean the caller referenced something that is
            // not there; surface them in the engine taxonomy.
            DbError::MissingGuild => EngineError::NotFound("guild"),
            DbError::MissingIncident => EngineError::NotFound("incident"),
            other => EngineError::Db(other),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
