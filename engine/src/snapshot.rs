//! Full-collection resnapshot planning.
//!
//! When incremental change feeds cannot close the gap (first sync, or offline
//! past the remote's retention window), the client lists every remote document
//! and merges the listing against the local mirror. Records with outstanding
//! local operations are left alone: local intent wins until it drains.

use crate::{Record, RecordId, RemoteDoc, Timestamp};
use std::collections::{HashMap, HashSet};

/// The writes needed to bring one collection in line with a remote listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResnapshotPlan {
    /// Remote documents to write into the local store
    pub upserts: Vec<RemoteDoc>,
    /// Synced records that no longer exist remotely
    pub purges: Vec<RecordId>,
    /// Records skipped because local operations are still pending
    pub deferred: Vec<RecordId>,
    /// Highest remote `updatedAt` in the listing
    pub cursor: Option<Timestamp>,
}

impl ResnapshotPlan {
    pub fn is_noop(&self) -> bool {
        self.upserts.is_empty() && self.purges.is_empty()
    }
}

/// Plan the merge of a full remote listing into `local`.
///
/// `pending` holds ids of records with non-terminal operations. Records that
/// were never confirmed remotely and have nothing pending (for example a
/// create that was dead-lettered) are kept so the write stays visible.
pub fn plan_resnapshot(
    local: &[Record],
    pending: &HashSet<RecordId>,
    remote: Vec<RemoteDoc>,
) -> ResnapshotPlan {
    let by_id: HashMap<&str, &Record> = local.iter().map(|r| (r.id.as_str(), r)).collect();
    let mut plan = ResnapshotPlan::default();
    let mut live: HashSet<RecordId> = HashSet::new();

    for doc in remote {
        plan.cursor = plan.cursor.max(Some(doc.updated_at));
        if doc.deleted {
            continue;
        }
        live.insert(doc.id.clone());

        if pending.contains(&doc.id) {
            plan.deferred.push(doc.id.clone());
            continue;
        }
        let unchanged = by_id.get(doc.id.as_str()).is_some_and(|r| {
            !r.tombstone
                && r.remote_revision.as_deref() == Some(doc.revision.as_str())
                && r.payload == doc.payload
        });
        if !unchanged {
            plan.upserts.push(doc);
        }
    }

    for record in local {
        if live.contains(&record.id) {
            continue;
        }
        if pending.contains(&record.id) {
            plan.deferred.push(record.id.clone());
        } else if record.remote_revision.is_some() {
            plan.purges.push(record.id.clone());
        }
    }

    plan.upserts.sort_by(|a, b| a.id.cmp(&b.id));
    plan.purges.sort();
    plan.deferred.sort();
    plan.deferred.dedup();
    plan
}
