//! Error types for the SQLite storage backend

use idbkit_core::Error;
use thiserror::Error;

/// Result type for internal SQLite operations
pub type Result<T> = std::result::Result<T, SqliteError>;

/// Errors that can occur during SQLite storage operations
#[derive(Debug, Error)]
pub enum SqliteError {
    /// Database connection or query error
    #[error("SQLite error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Schema metadata could not be serialized or parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Staged writes name a store or index missing from the schema
    #[error("Schema error: {0}")]
    Schema(String),

    /// IO error (database directory handling)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Every SQLite failure surfaces to the engine as a transient backend error.
impl From<SqliteError> for Error {
    fn from(err: SqliteError) -> Self {
        match err {
            SqliteError::Database(e) => Error::Backend(format!("SQLite: {}", e)),
            SqliteError::Json(e) => Error::Backend(format!("schema metadata: {}", e)),
            SqliteError::Migration(msg) => Error::Backend(format!("Migration: {}", msg)),
            SqliteError::Schema(msg) => Error::Backend(format!("schema: {}", msg)),
            SqliteError::Io(e) => Error::Backend(format!("IO: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_map_to_backend() {
        let err: Error = SqliteError::Migration("bad".into()).into();
        assert_eq!(err, Error::Backend("Migration: bad".into()));
        assert!(err.is_retryable());

        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = SqliteError::from(io).into();
        assert_eq!(err.name(), "UnknownError");
    }
}
