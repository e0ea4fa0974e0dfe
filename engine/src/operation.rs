//! Operation types for the local write-ahead queue.
//!
//! Local writes are expressed as operations, not direct remote calls. They
//! are appended to the operation log in issuance order and drained later.

use crate::{
    CollectionName, Epoch, Error, LocalRevision, OperationId, RecordId, Revision, Seq, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What an operation does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OpKind::Create),
            "update" => Ok(OpKind::Update),
            "delete" => Ok(OpKind::Delete),
            other => Err(Error::InvalidPayload(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

/// Lifecycle state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    /// Waiting to be dispatched (possibly in backoff)
    Pending,
    /// Acknowledged by the remote store
    Synced,
    /// Permanently rejected or lost a conflict
    Discarded,
    /// Exceeded the retry limit, kept for inspection
    DeadLettered,
    /// Waiting for a manual conflict decision
    Conflicted,
}

impl OpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Pending => "pending",
            OpStatus::Synced => "synced",
            OpStatus::Discarded => "discarded",
            OpStatus::DeadLettered => "dead_lettered",
            OpStatus::Conflicted => "conflicted",
        }
    }

    /// Terminal operations no longer hold back later operations on the same
    /// record.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OpStatus::Synced | OpStatus::Discarded | OpStatus::DeadLettered
        )
    }
}

impl fmt::Display for OpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OpStatus::Pending),
            "synced" => Ok(OpStatus::Synced),
            "discarded" => Ok(OpStatus::Discarded),
            "dead_lettered" => Ok(OpStatus::DeadLettered),
            "conflicted" => Ok(OpStatus::Conflicted),
            other => Err(Error::InvalidPayload(format!(
                "unknown operation status: {other}"
            ))),
        }
    }
}

/// The write a commit asks the remote store to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Mutation {
    /// Replace the whole document
    Set(serde_json::Value),
    /// Shallow-merge fields into the document
    Patch(serde_json::Value),
    Delete,
}

/// An operation before the log has assigned it a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    /// Idempotency key sent with the remote commit
    pub op_id: OperationId,
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub kind: OpKind,
    /// Full payload for creates, patch for updates, null for deletes
    pub payload: serde_json::Value,
    /// Remote revision this write was based on
    pub base_revision: Option<Revision>,
    /// Record local revision this write produced
    pub revision: LocalRevision,
    /// Wall-clock issuance time
    pub created_at: Timestamp,
}

impl NewOperation {
    /// Create a new create operation.
    pub fn create(
        op_id: impl Into<OperationId>,
        collection: impl Into<CollectionName>,
        record_id: impl Into<RecordId>,
        payload: serde_json::Value,
        revision: LocalRevision,
        created_at: Timestamp,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            collection: collection.into(),
            record_id: record_id.into(),
            kind: OpKind::Create,
            payload,
            base_revision: None,
            revision,
            created_at,
        }
    }

    /// Create a new update operation carrying a patch.
    pub fn update(
        op_id: impl Into<OperationId>,
        collection: impl Into<CollectionName>,
        record_id: impl Into<RecordId>,
        patch: serde_json::Value,
        base_revision: Option<Revision>,
        revision: LocalRevision,
        created_at: Timestamp,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            collection: collection.into(),
            record_id: record_id.into(),
            kind: OpKind::Update,
            payload: patch,
            base_revision,
            revision,
            created_at,
        }
    }

    /// Create a new delete operation.
    pub fn delete(
        op_id: impl Into<OperationId>,
        collection: impl Into<CollectionName>,
        record_id: impl Into<RecordId>,
        base_revision: Option<Revision>,
        revision: LocalRevision,
        created_at: Timestamp,
    ) -> Self {
        Self {
            op_id: op_id.into(),
            collection: collection.into(),
            record_id: record_id.into(),
            kind: OpKind::Delete,
            payload: serde_json::Value::Null,
            base_revision,
            revision,
            created_at,
        }
    }
}

/// A write intent stored in the operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Monotonic position in the log
    pub seq: Seq,
    pub op_id: OperationId,
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub kind: OpKind,
    pub payload: serde_json::Value,
    pub base_revision: Option<Revision>,
    pub revision: LocalRevision,
    pub created_at: Timestamp,
    pub status: OpStatus,
    /// Failed dispatch attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Not eligible for dispatch before this time
    pub next_attempt_at: Timestamp,
    /// Leader epoch that last dispatched this operation
    pub claim_epoch: Option<Epoch>,
}

impl Operation {
    /// Build the stored form of a freshly appended operation.
    pub fn from_new(seq: Seq, op: NewOperation) -> Self {
        Self {
            seq,
            op_id: op.op_id,
            collection: op.collection,
            record_id: op.record_id,
            kind: op.kind,
            payload: op.payload,
            base_revision: op.base_revision,
            revision: op.revision,
            created_at: op.created_at,
            status: OpStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: 0,
            claim_epoch: None,
        }
    }

    /// The `(collection, record)` pair this operation serializes on.
    pub fn key(&self) -> (&str, &str) {
        (&self.collection, &self.record_id)
    }

    pub fn is_synced(&self) -> bool {
        self.status == OpStatus::Synced
    }

    /// Pending and out of backoff.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status == OpStatus::Pending && self.next_attempt_at <= now
    }

    /// The remote write this operation asks for.
    pub fn mutation(&self) -> Mutation {
        match self.kind {
            OpKind::Create => Mutation::Set(self.payload.clone()),
            OpKind::Update => Mutation::Patch(self.payload.clone()),
            OpKind::Delete => Mutation::Delete,
        }
    }
}

/// Shallow JSON merge: object fields in `patch` overwrite those in `target`,
/// `null` removes a field. A non-object patch replaces the target outright.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    let Some(fields) = patch.as_object() else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = serde_json::Value::Object(serde_json::Map::new());
    }
    if let Some(obj) = target.as_object_mut() {
        for (key, value) in fields {
            if value.is_null() {
                obj.remove(key);
            } else {
                obj.insert(key.clone(), value.clone());
            }
        }
    }
}
