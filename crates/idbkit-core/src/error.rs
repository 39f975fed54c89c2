//! Engine error types
//!
//! Every variant maps to one IndexedDB `DOMException` name so callers can
//! tell "retry is meaningless" failures apart from transient storage ones.

use thiserror::Error;

/// Errors that can occur during engine operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Unique index violation, or `add` with an existing primary key
    #[error("ConstraintError: {0}")]
    Constraint(String),

    /// Invalid key or key range supplied
    #[error("DataError: {0}")]
    Data(String),

    /// Value could not be cloned into or out of storage
    #[error("DataCloneError: {0}")]
    DataClone(String),

    /// Operation on a deleted store/index, or schema change outside an upgrade
    #[error("InvalidStateError: {0}")]
    InvalidState(String),

    /// Invalid argument combination (empty scope, bad key path, bad version)
    #[error("InvalidAccessError: {0}")]
    InvalidAccess(String),

    /// Named object store or index does not exist
    #[error("NotFoundError: {0}")]
    NotFound(String),

    /// Write attempted in a readonly transaction
    #[error("ReadOnlyError: {0}")]
    ReadOnly(String),

    /// Transaction is committing, aborting or finished
    #[error("TransactionInactiveError: {0}")]
    TransactionInactive(String),

    /// Requested version is lower than the stored one or conflicts with an open connection
    #[error("VersionError: {0}")]
    Version(String),

    /// Operation interrupted by a transaction abort
    #[error("AbortError: {0}")]
    Abort(String),

    /// Storage backend failure (database, filesystem, etc.)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl Error {
    /// The IndexedDB `DOMException` name for this error.
    pub fn name(&self) -> &'static str {
        match self {
            Error::Constraint(_) => "ConstraintError",
            Error::Data(_) => "DataError",
            Error::DataClone(_) => "DataCloneError",
            Error::InvalidState(_) => "InvalidStateError",
            Error::InvalidAccess(_) => "InvalidAccessError",
            Error::NotFound(_) => "NotFoundError",
            Error::ReadOnly(_) => "ReadOnlyError",
            Error::TransactionInactive(_) => "TransactionInactiveError",
            Error::Version(_) => "VersionError",
            Error::Abort(_) => "AbortError",
            Error::Backend(_) => "UnknownError",
        }
    }

    /// Whether retrying the same operation later could succeed.
    ///
    /// Only backend I/O failures are transient; every other kind is a
    /// property of the request itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Backend(_))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;
