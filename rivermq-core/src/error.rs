//! RiverMQ error abstractions.

use thiserror::Error;

/// Reconciliation error variants.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A platform object was absent where one was expected.
    ///
    /// This is the expected condition on a first pass and triggers creation rather than
    /// failure; it is an error only when surfaced past the diff engine.
    #[error("object not found: {0}")]
    NotFound(String),
    /// A transient platform failure on a single object: network, timeout or write conflict.
    ///
    /// The affected object is retried on the next scheduled pass; the remainder of the
    /// current pass continues.
    #[error("transient platform error: {0}")]
    Transient(#[source] anyhow::Error),
    /// The declared cluster is malformed and cannot produce a valid reconciliation record.
    ///
    /// Surfaced on the declared cluster's status; not retried until the declaration changes.
    #[error("invalid declaration: {0}")]
    InvalidDeclaration(String),
    /// A stored recovery snapshot failed to deserialize.
    ///
    /// Treated as not-found by the controller, which falls back to a fresh record.
    #[error("recovery snapshot is corrupt: {0}")]
    RecoveryCorrupt(String),
}

impl ReconcileError {
    /// Whether this error aborts the current convergence pass entirely.
    ///
    /// Only a declaration which cannot produce a minimally valid reconciliation record
    /// aborts a pass; everything else is retried incrementally.
    pub fn is_fatal_to_pass(&self) -> bool {
        matches!(self, Self::InvalidDeclaration(_))
    }
}
