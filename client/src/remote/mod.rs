//! The remote document store the client synchronizes against.
//!
//! [`RemoteStore`] is the seam between the sync coordinator and whatever
//! backend hosts the collections. [`MemoryRemote`] implements it in process.

mod memory;

pub use memory::MemoryRemote;

use std::future::Future;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tether_engine::{
    CollectionName, Mutation, OperationId, RecordId, RemoteDoc, Revision, Timestamp,
};

/// A stream of remote document changes, oldest first.
pub type ChangeFeed = BoxStream<'static, RemoteDoc>;

/// One write sent to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub collection: CollectionName,
    pub id: RecordId,
    /// Lets the remote recognise a replay of a commit it already applied
    pub op_id: OperationId,
    pub mutation: Mutation,
    /// Revision the write was based on; `None` for a create
    pub expected_revision: Option<Revision>,
    /// When the write was made locally; stored as the document's `updatedAt`
    pub issued_at: Timestamp,
}

/// Errors reported by a remote store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// The document moved past `expected_revision`
    #[error("Revision conflict on {}/{}", current.collection, current.id)]
    Conflict { current: Box<RemoteDoc> },

    /// The write is invalid and will never succeed
    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Remote store unreachable")]
    Offline,

    /// The change feed can no longer replay from the requested cursor
    #[error("Change feed cursor expired")]
    CursorExpired,
}

impl RemoteError {
    pub fn conflict(current: RemoteDoc) -> Self {
        RemoteError::Conflict {
            current: Box::new(current),
        }
    }

    /// Whether the same call may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Offline)
    }
}

/// A remote document store with revisioned documents and change feeds.
pub trait RemoteStore: Send + Sync + 'static {
    /// Fetch one document; deleted documents may come back with `deleted` set.
    fn get_doc(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = Result<Option<RemoteDoc>, RemoteError>> + Send;

    /// List every document in a collection.
    fn list_docs(
        &self,
        collection: &str,
    ) -> impl Future<Output = Result<Vec<RemoteDoc>, RemoteError>> + Send;

    /// Apply a write and return the resulting document.
    ///
    /// Committing the same `op_id` twice must not apply it twice.
    fn commit_doc(
        &self,
        commit: Commit,
    ) -> impl Future<Output = Result<RemoteDoc, RemoteError>> + Send;

    /// Stream changes with `updated_at >= since`, then live changes.
    fn listen_collection(
        &self,
        collection: &str,
        since: Option<Timestamp>,
    ) -> impl Future<Output = Result<ChangeFeed, RemoteError>> + Send;
}
