//! Error types for the Tether engine.

use crate::{CollectionName, RecordId};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("index '{index}' is not defined on collection {collection}")]
    IndexNotFound {
        collection: CollectionName,
        index: String,
    },

    // Payload errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    // Record errors
    #[error("record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("operation on deleted record: {0}")]
    OperationOnDeleted(RecordId),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
