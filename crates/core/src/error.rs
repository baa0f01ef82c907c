//! Domain error model.

use thiserror::Error;

use crate::invariant::InvariantCode;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// invariants, conflicts). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A clinical invariant was violated; the code is the stable identifier
    /// surfaced to callers and the review queue.
    #[error("{code}: {message}")]
    Invariant {
        code: InvariantCode,
        message: String,
    },

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(code: InvariantCode, msg: impl Into<String>) -> Self {
        Self::Invariant {
            code,
            message: msg.into(),
        }
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// The invariant code, when this error carries one.
    pub fn invariant_code(&self) -> Option<InvariantCode> {
        match self {
            Self::Invariant { code, .. } => Some(*code),
            _ => None,
        }
    }
}
