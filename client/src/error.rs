//! Unified error handling for the client.

use tether_engine::{CollectionName, RecordId, Seq};

use crate::remote::RemoteError;

/// Client error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Engine error: {0}")]
    Engine(#[from] tether_engine::Error),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Not found: {collection}/{id}")]
    NotFound {
        collection: CollectionName,
        id: RecordId,
    },

    #[error("Operation {0} not found")]
    OperationNotFound(Seq),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    ///
    /// Local I/O failures (locked database, full disk) and transient remote
    /// failures are retryable; everything else needs a different input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(sqlx::Error::RowNotFound) => false,
            Error::Storage(_) => true,
            Error::Remote(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
