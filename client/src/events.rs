//! Coordinator states and the events surfaced to the UI and operators.

use std::fmt;

use serde::{Deserialize, Serialize};
use tether_engine::{
    CollectionName, ConflictResolution, RecordId, Revision, Role, Seq, TabId,
};

/// Sync coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    /// Not started, offline with nothing in flight, or not the leader
    Idle,
    /// Dispatching queued operations
    Draining,
    /// Following remote change feeds
    Listening,
    /// Running a full resnapshot
    Reconciling,
    /// Lost connectivity while working
    Suspended,
}

impl SyncState {
    /// States in which the tab talks to the remote store.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Draining | SyncState::Listening | SyncState::Reconciling
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Draining => "draining",
            SyncState::Listening => "listening",
            SyncState::Reconciling => "reconciling",
            SyncState::Suspended => "suspended",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the UI or an operator may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SyncEvent {
    StateChanged {
        tab_id: TabId,
        from: SyncState,
        to: SyncState,
    },
    LeadershipChanged {
        tab_id: TabId,
        role: Role,
    },
    /// The remote refused an operation for good; the local write was rolled back
    Rejected {
        seq: Seq,
        collection: CollectionName,
        record_id: RecordId,
        reason: String,
    },
    /// An operation ran out of attempts
    DeadLettered {
        seq: Seq,
        collection: CollectionName,
        record_id: RecordId,
        error: String,
    },
    ConflictResolved {
        seq: Seq,
        collection: CollectionName,
        record_id: RecordId,
        resolution: ConflictResolution,
    },
    /// A conflict is waiting for someone to pick a side
    ConflictDetected {
        seq: Seq,
        collection: CollectionName,
        record_id: RecordId,
        remote_revision: Revision,
    },
    /// The remote stored a created record under a different id
    IdReassigned {
        collection: CollectionName,
        local_id: RecordId,
        remote_id: RecordId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(SyncState::Draining.is_active());
        assert!(!SyncState::Suspended.is_active());
        assert!(!SyncState::Idle.is_active());
        assert_eq!(SyncState::Reconciling.to_string(), "reconciling");
    }

    #[test]
    fn event_serialization() {
        let event = SyncEvent::IdReassigned {
            collection: "tasks".into(),
            local_id: "l1".into(),
            remote_id: "srv-1".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "idReassigned");
        assert_eq!(value["localId"], "l1");

        let parsed: SyncEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, event);
    }
}
