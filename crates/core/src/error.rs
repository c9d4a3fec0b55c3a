//! Domain and workflow error models.

use thiserror::Error;

use crate::id::SaleId;

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

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A conflict occurred (e.g. state transition not allowed twice).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Storage-layer failure during the emission transaction.
///
/// Subtypes are distinguished because each implies a different corrective
/// action: a conflict points at a concurrency-control bug, a timeout at a
/// stuck lock holder, a constraint violation at inconsistent data.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Concurrent-update conflict (deadlock, conditional write precondition
    /// mismatch). Under the emission row lock this signals a locking bug and
    /// is surfaced rather than swallowed.
    #[error("persistence conflict: {0}")]
    Conflict(String),

    /// Lock or statement timeout while waiting on the series row.
    #[error("persistence timeout: {0}")]
    Timeout(String),

    /// Unique/check constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Any other storage error (connection loss, pool closed, ...).
    #[error("storage error: {0}")]
    Storage(String),
}

/// Failure taxonomy of the invoice emission workflow.
///
/// Each precondition check surfaces as a distinct kind, never a generic
/// failure: the caller's corrective action differs for each (pick a different
/// sale, do not re-invoice, configure a series, retry).
#[derive(Debug, Error)]
pub enum EmitError {
    /// No sale with the given identifier exists.
    #[error("sale not found: {0}")]
    SaleNotFound(SaleId),

    /// The sale is already referenced by an invoice.
    #[error("sale already invoiced: {0}")]
    AlreadyInvoiced(SaleId),

    /// No invoicing series has `active = true`.
    #[error("no active invoicing series configured")]
    NoActiveSeries,

    /// Storage-layer failure; the transaction was rolled back.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

pub type EmitResult<T> = Result<T, EmitError>;
