//! Error taxonomy for the booking engine.
//!
//! Callers can tell "invalid input" from "missing entity" from "storage
//! failure" without parsing message strings. Storage failures abort the
//! per-definition transactional scope; validation errors are raised before
//! any write happens.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    /// Rejected before any write: bad category, zero amount, over-long
    /// note, unparseable timezone.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested entity does not exist for this organization.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A versioning step affected an unexpected number of rows; the
    /// surrounding transactional scope must be rolled back.
    #[error("versioning conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Storage(#[from] sqlx::Error),
}

pub type DomainResult<T> = Result<T, DomainError>;
