//! Per-collection sync bookkeeping.

use crate::{CollectionName, Timestamp};
use serde::{Deserialize, Serialize};

/// How far a collection is known to be consistent with the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    pub collection: CollectionName,
    /// Last local time the collection was confirmed in sync
    pub last_synced_at: Option<Timestamp>,
    /// Last local time a full resnapshot completed
    pub last_full_resync_at: Option<Timestamp>,
    /// Highest remote `updatedAt` merged so far; change feeds resume here
    pub cursor: Option<Timestamp>,
}

impl SyncMeta {
    /// Metadata for a collection that has never synced.
    pub fn new(collection: impl Into<CollectionName>) -> Self {
        Self {
            collection: collection.into(),
            last_synced_at: None,
            last_full_resync_at: None,
            cursor: None,
        }
    }

    /// Whether incremental listening can no longer be trusted to close the gap.
    ///
    /// True when the collection never synced, or was last seen in sync longer
    /// ago than the remote feed's retention window.
    pub fn needs_resnapshot(&self, now: Timestamp, retention_ms: u64) -> bool {
        match (self.last_synced_at, self.cursor) {
            (Some(at), Some(_)) => now.saturating_sub(at) > retention_ms,
            _ => true,
        }
    }

    /// Advance after merging an incremental change.
    pub fn observe_change(&mut self, remote_updated_at: Timestamp, now: Timestamp) {
        self.cursor = self.cursor.max(Some(remote_updated_at));
        self.last_synced_at = Some(now);
    }

    /// Mark the collection consistent as of now without moving the cursor.
    pub fn touch(&mut self, now: Timestamp) {
        self.last_synced_at = Some(now);
    }

    /// Record a completed full resnapshot.
    pub fn complete_resync(&mut self, cursor: Option<Timestamp>, now: Timestamp) {
        self.cursor = match (self.cursor, cursor) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b).or(Some(0)),
        };
        self.last_synced_at = Some(now);
        self.last_full_resync_at = Some(now);
    }
}
