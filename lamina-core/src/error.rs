//! Error types for lamina operations

use crate::{OptimisticId, PrimaryKey};
use thiserror::Error;

/// Errors surfaced by the fetch and metadata collaborators.
///
/// These are stored as entry state rather than thrown, so subscribers can
/// render them. Only `Transient` failures are worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Object not found: {object_type} with primary key {primary_key}")]
    NotFound {
        object_type: String,
        primary_key: PrimaryKey,
    },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Transient fetch failure: {reason}")]
    Transient { reason: String },

    #[error("Metadata unavailable for {object_type}: {reason}")]
    Metadata { object_type: String, reason: String },

    #[error("Link {link} not found on {object_type}")]
    LinkNotFound { object_type: String, link: String },
}

impl FetchError {
    /// Convenience constructor for a not-found failure.
    pub fn not_found(object_type: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self::NotFound {
            object_type: object_type.into(),
            primary_key: primary_key.into(),
        }
    }

    /// Convenience constructor for a transient failure.
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// Whether a later revalidation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether this is a not-found failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failures of an optimistic job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OptimisticError {
    #[error("Optimistic creation of {object_type} failed in layer {optimistic_id}: {reason}")]
    CreationFailed {
        optimistic_id: OptimisticId,
        object_type: String,
        reason: String,
    },

    #[error("Optimistic write failed in layer {optimistic_id}: {reason}")]
    WriteFailed {
        optimistic_id: OptimisticId,
        reason: String,
    },
}

/// Programmer errors. These are not recovered from.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvariantError {
    #[error("Optimistic layer {optimistic_id} was already removed")]
    LayerRetired { optimistic_id: OptimisticId },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Cache key kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: String, found: String },

    #[error("Canonicalizer produced different output for identical input: {input}")]
    NonDeterministicCanonical { input: String },

    #[error("Store was dropped while {operation} was pending")]
    StoreDropped { operation: String },

    #[error("Background task aborted: {reason}")]
    TaskAborted { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all lamina errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Optimistic error: {0}")]
    Optimistic(#[from] OptimisticError),

    #[error("Invariant violated: {0}")]
    Invariant(#[from] InvariantError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Borrow the fetch error, if this is one.
    pub fn as_fetch(&self) -> Option<&FetchError> {
        match self {
            Self::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for lamina operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
