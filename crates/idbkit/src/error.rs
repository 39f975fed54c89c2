//! Error type for facade operations (configuration and backend setup).

use thiserror::Error;

/// Errors raised while loading configuration or constructing a factory.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite backend could not be opened
    #[error("sqlite error: {0}")]
    Sqlite(#[from] idbkit_sqlite::SqliteError),

    /// Engine error
    #[error(transparent)]
    Engine(#[from] idbkit_core::Error),
}

/// Result type alias using the facade Error.
pub type Result<T> = std::result::Result<T, Error>;
