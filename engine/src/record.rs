//! Record types for the local mirror of remote documents.

use crate::operation::merge_patch;
use crate::{error::Result, CollectionName, Error, LocalRevision, RecordId, Revision, Timestamp};
use serde::{Deserialize, Serialize};

/// A document as the remote store reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDoc {
    pub collection: CollectionName,
    pub id: RecordId,
    pub payload: serde_json::Value,
    /// Revision token, changes on every remote write
    pub revision: Revision,
    /// Remote write time (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// The document was deleted remotely
    #[serde(default)]
    pub deleted: bool,
}

/// The locally cached, merged view of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Collection this record belongs to
    pub collection: CollectionName,
    /// Unique identifier for this record
    pub id: RecordId,
    /// Current merged payload (JSON value)
    pub payload: serde_json::Value,
    /// Last revision token confirmed by the remote store
    pub remote_revision: Option<Revision>,
    /// Incremented on every local mutation
    pub local_revision: LocalRevision,
    /// The local revision last acknowledged by the remote store
    pub synced_revision: LocalRevision,
    /// Last payload confirmed by the remote store
    pub remote_payload: Option<serde_json::Value>,
    /// Last modification time (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Soft delete flag, cleared only by purge or a remote resurrection
    pub tombstone: bool,
}

impl Record {
    /// Create a record from a local write. It starts out unsynced.
    pub fn new_local(
        collection: impl Into<CollectionName>,
        id: impl Into<RecordId>,
        payload: serde_json::Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            payload,
            remote_revision: None,
            local_revision: 1,
            synced_revision: 0,
            remote_payload: None,
            updated_at: timestamp,
            tombstone: false,
        }
    }

    /// Create a record from a remote document. It starts out in sync.
    pub fn from_remote(doc: &RemoteDoc) -> Self {
        Self {
            collection: doc.collection.clone(),
            id: doc.id.clone(),
            payload: doc.payload.clone(),
            remote_revision: Some(doc.revision.clone()),
            local_revision: 0,
            synced_revision: 0,
            remote_payload: Some(doc.payload.clone()),
            updated_at: doc.updated_at,
            tombstone: false,
        }
    }

    /// Check if record is active (not tombstoned).
    pub fn is_active(&self) -> bool {
        !self.tombstone
    }

    /// Whether at least one local mutation has not been acknowledged.
    pub fn has_unsynced(&self) -> bool {
        self.local_revision > self.synced_revision
    }

    /// Apply a local patch (shallow merge, `null` removes a field).
    pub fn apply_patch(&mut self, patch: &serde_json::Value, timestamp: Timestamp) -> Result<()> {
        if self.tombstone {
            return Err(Error::OperationOnDeleted(self.id.clone()));
        }
        merge_patch(&mut self.payload, patch);
        self.local_revision += 1;
        self.updated_at = timestamp;
        Ok(())
    }

    /// Tombstone the record. The payload is cleared; the row stays until the
    /// delete is confirmed.
    pub fn mark_deleted(&mut self, timestamp: Timestamp) -> Result<()> {
        if self.tombstone {
            return Err(Error::OperationOnDeleted(self.id.clone()));
        }
        self.tombstone = true;
        self.payload = serde_json::Value::Null;
        self.local_revision += 1;
        self.updated_at = timestamp;
        Ok(())
    }

    /// Record a remote acknowledgement of the local mutation `acked_revision`.
    ///
    /// When nothing newer is queued locally, the visible payload converges to
    /// the remote's copy.
    pub fn acknowledge(&mut self, doc: &RemoteDoc, acked_revision: LocalRevision) {
        self.remote_revision = Some(doc.revision.clone());
        self.remote_payload = Some(doc.payload.clone());
        self.synced_revision = self.synced_revision.max(acked_revision);
        if !self.has_unsynced() {
            self.payload = doc.payload.clone();
            self.tombstone = doc.deleted;
            self.updated_at = self.updated_at.max(doc.updated_at);
        }
    }

    /// Overwrite the record with remote state. Only valid when no local
    /// operation is outstanding for it. Returns whether anything changed.
    pub fn apply_remote(&mut self, doc: &RemoteDoc) -> bool {
        let unchanged = self.remote_revision.as_deref() == Some(doc.revision.as_str())
            && self.payload == doc.payload
            && !self.tombstone;
        if unchanged {
            return false;
        }
        self.payload = doc.payload.clone();
        self.remote_payload = Some(doc.payload.clone());
        self.remote_revision = Some(doc.revision.clone());
        self.synced_revision = self.local_revision;
        self.updated_at = doc.updated_at;
        self.tombstone = false;
        true
    }

    /// Roll the visible state back to the last remote-confirmed payload.
    ///
    /// Returns `false` when the record was never confirmed remotely, in which
    /// case the caller should drop it.
    pub fn revert_to_remote(&mut self) -> bool {
        match &self.remote_payload {
            Some(payload) => {
                self.payload = payload.clone();
                self.tombstone = false;
                self.synced_revision = self.local_revision;
                true
            }
            None => false,
        }
    }
}
