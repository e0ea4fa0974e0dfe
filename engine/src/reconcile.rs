//! Conflict resolution between a queued local operation and the remote
//! document that rejected it.
//!
//! This is the core of determinism. Given the operation, the last payload
//! both sides agreed on (the record's shadow copy) and the remote's current
//! document, [`resolve_conflict`] always produces the same outcome.
//!
//! # Algorithm
//!
//! 1. If the remote already reflects the operation (a replay), treat it as
//!    acknowledged
//! 2. `Manual` collections park the operation
//! 3. `FieldMerge` updates keep every field only one side touched and give
//!    fields both sides touched to the later writer
//! 4. Everything else is last-writer-wins on wall-clock time; ties go to the
//!    remote store. A winning update replaces the document with the local
//!    view of it, so the loser's other fields are dropped

use crate::{operation::merge_patch, Mutation, OpKind, Operation, RemoteDoc};
use serde::{Deserialize, Serialize};

/// Conflict policy for a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Later `createdAt` vs remote `updatedAt` wins (default)
    #[default]
    LastWriterWins,
    /// Three-way merge of top-level fields, later writer wins per field
    FieldMerge,
    /// No deterministic rule; a person decides
    Manual,
}

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Local operation won
    LocalWins,
    /// Remote document won
    RemoteWins,
    /// Both sides contributed fields
    Merged,
}

/// What the sync coordinator should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictOutcome {
    /// The remote already contains this write; acknowledge it
    AlreadyApplied,
    /// Write `mutation` against the remote's current revision
    Recommit {
        mutation: Mutation,
        resolution: ConflictResolution,
    },
    /// Drop the operation and adopt the remote state
    AcceptRemote,
    /// Park the operation until someone resolves it
    Manual,
}

/// Resolve a rejected commit.
///
/// `shadow` is the last payload confirmed by the remote store for this record,
/// the common ancestor for field-level merges.
pub fn resolve_conflict(
    policy: ConflictPolicy,
    op: &Operation,
    shadow: Option<&serde_json::Value>,
    remote: &RemoteDoc,
) -> ConflictOutcome {
    if already_applied(op, remote) {
        return ConflictOutcome::AlreadyApplied;
    }

    match policy {
        ConflictPolicy::Manual => ConflictOutcome::Manual,
        ConflictPolicy::FieldMerge if op.kind == OpKind::Update && !remote.deleted => {
            field_merge(op, shadow, remote)
        }
        _ => last_writer_wins(op, shadow, remote),
    }
}

fn local_is_later(op: &Operation, remote: &RemoteDoc) -> bool {
    op.created_at > remote.updated_at
}

fn last_writer_wins(
    op: &Operation,
    shadow: Option<&serde_json::Value>,
    remote: &RemoteDoc,
) -> ConflictOutcome {
    if !local_is_later(op, remote) {
        return ConflictOutcome::AcceptRemote;
    }

    let mutation = match op.kind {
        OpKind::Create => Mutation::Set(op.payload.clone()),
        OpKind::Delete => Mutation::Delete,
        // The winner's whole view of the document replaces the remote's,
        // which also resurrects a document deleted remotely.
        OpKind::Update if shadow.is_some() || remote.deleted => {
            let mut base = shadow
                .cloned()
                .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
            merge_patch(&mut base, &op.payload);
            Mutation::Set(base)
        }
        OpKind::Update => Mutation::Patch(op.payload.clone()),
    };

    ConflictOutcome::Recommit {
        mutation,
        resolution: ConflictResolution::LocalWins,
    }
}

fn field_merge(
    op: &Operation,
    shadow: Option<&serde_json::Value>,
    remote: &RemoteDoc,
) -> ConflictOutcome {
    let (Some(patch), Some(theirs)) = (op.payload.as_object(), remote.payload.as_object()) else {
        return last_writer_wins(op, shadow, remote);
    };
    let empty = serde_json::Map::new();
    let base = shadow.and_then(|s| s.as_object()).unwrap_or(&empty);
    let local_later = local_is_later(op, remote);

    let mut merged = serde_json::Map::new();
    for (field, ours) in patch {
        let ours_value = (!ours.is_null()).then_some(ours);
        let their_value = theirs.get(field);
        if ours_value == their_value {
            continue;
        }
        let remote_touched = their_value != base.get(field);
        if !remote_touched || local_later {
            merged.insert(field.clone(), ours.clone());
        }
    }

    if merged.is_empty() {
        ConflictOutcome::AcceptRemote
    } else {
        ConflictOutcome::Recommit {
            mutation: Mutation::Patch(serde_json::Value::Object(merged)),
            resolution: ConflictResolution::Merged,
        }
    }
}

/// Whether the remote document already reflects `op`, as happens when a
/// commit is replayed after the remote acknowledged it but before the log
/// recorded that.
fn already_applied(op: &Operation, remote: &RemoteDoc) -> bool {
    match op.kind {
        OpKind::Delete => remote.deleted,
        OpKind::Create => !remote.deleted && remote.payload == op.payload,
        OpKind::Update => {
            if remote.deleted {
                return false;
            }
            match (op.payload.as_object(), remote.payload.as_object()) {
                (Some(patch), Some(doc)) => patch.iter().all(|(field, value)| {
                    if value.is_null() {
                        !doc.contains_key(field)
                    } else {
                        doc.get(field) == Some(value)
                    }
                }),
                _ => false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewOperation;
    use serde_json::json;

    fn update(patch: serde_json::Value, created_at: u64) -> Operation {
        Operation::from_new(
            1,
            NewOperation::update(
                "op-1",
                "tasks",
                "t1",
                patch,
                Some("r1".into()),
                2,
                created_at,
            ),
        )
    }

    fn remote(payload: serde_json::Value, updated_at: u64) -> RemoteDoc {
        RemoteDoc {
            collection: "tasks".into(),
            id: "t1".into(),
            payload,
            revision: "r2".into(),
            updated_at,
            deleted: false,
        }
    }

    #[test]
    fn lww_local_later_recommits() {
        let op = update(json!({"priority": "high"}), 2_000);
        let doc = remote(json!({"priority": "medium"}), 1_500);

        assert_eq!(
            resolve_conflict(ConflictPolicy::LastWriterWins, &op, None, &doc),
            ConflictOutcome::Recommit {
                mutation: Mutation::Patch(json!({"priority": "high"})),
                resolution: ConflictResolution::LocalWins,
            }
        );
    }

    #[test]
    fn lww_local_win_replaces_remote_fields() {
        let shadow = json!({"title": "A", "priority": "low"});
        let op = update(json!({"priority": "high"}), 2_000);
        let doc = remote(json!({"title": "A", "priority": "low", "status": "done"}), 1_500);

        assert_eq!(
            resolve_conflict(ConflictPolicy::LastWriterWins, &op, Some(&shadow), &doc),
            ConflictOutcome::Recommit {
                mutation: Mutation::Set(json!({"title": "A", "priority": "high"})),
                resolution: ConflictResolution::LocalWins,
            }
        );
    }

    #[test]
    fn lww_remote_later_wins() {
        let op = update(json!({"priority": "high"}), 1_000);
        let doc = remote(json!({"priority": "medium"}), 1_500);

        assert_eq!(
            resolve_conflict(ConflictPolicy::LastWriterWins, &op, None, &doc),
            ConflictOutcome::AcceptRemote
        );
    }

    #[test]
    fn lww_tie_goes_to_remote() {
        let op = update(json!({"priority": "high"}), 1_500);
        let doc = remote(json!({"priority": "medium"}), 1_500);

        assert_eq!(
            resolve_conflict(ConflictPolicy::LastWriterWins, &op, None, &doc),
            ConflictOutcome::AcceptRemote
        );
    }

    #[test]
    fn replayed_update_is_recognised() {
        let op = update(json!({"priority": "high", "note": null}), 1_000);
        let doc = remote(json!({"priority": "high", "title": "A"}), 5_000);

        assert_eq!(
            resolve_conflict(ConflictPolicy::Manual, &op, None, &doc),
            ConflictOutcome::AlreadyApplied
        );
    }

    #[test]
    fn replayed_delete_is_recognised() {
        let op = Operation::from_new(1, NewOperation::delete("op-1", "tasks", "t1", None, 2, 1));
        let mut doc = remote(serde_json::Value::Null, 5_000);
        doc.deleted = true;

        assert_eq!(
            resolve_conflict(ConflictPolicy::LastWriterWins, &op, None, &doc),
            ConflictOutcome::AlreadyApplied
        );
    }

    #[test]
    fn field_merge_keeps_non_conflicting_fields_of_the_loser() {
        // Both started from the shadow. Remote changed `status`, and also
        // `priority` later than us; we changed `priority` and `note`.
        let shadow = json!({"status": "open", "priority": "low", "note": "x"});
        let op = update(json!({"priority": "high", "note": "mine"}), 1_000);
        let doc = remote(
            json!({"status": "done", "priority": "medium", "note": "x"}),
            2_000,
        );

        assert_eq!(
            resolve_conflict(ConflictPolicy::FieldMerge, &op, Some(&shadow), &doc),
            ConflictOutcome::Recommit {
                mutation: Mutation::Patch(json!({"note": "mine"})),
                resolution: ConflictResolution::Merged,
            }
        );
    }

    #[test]
    fn field_merge_later_local_takes_conflicting_fields() {
        let shadow = json!({"priority": "low"});
        let op = update(json!({"priority": "high"}), 3_000);
        let doc = remote(json!({"priority": "medium"}), 2_000);

        assert!(matches!(
            resolve_conflict(ConflictPolicy::FieldMerge, &op, Some(&shadow), &doc),
            ConflictOutcome::Recommit {
                resolution: ConflictResolution::Merged,
                ..
            }
        ));
    }

    #[test]
    fn field_merge_with_nothing_left_accepts_remote() {
        let shadow = json!({"priority": "low"});
        let op = update(json!({"priority": "high"}), 1_000);
        let doc = remote(json!({"priority": "medium"}), 2_000);

        assert_eq!(
            resolve_conflict(ConflictPolicy::FieldMerge, &op, Some(&shadow), &doc),
            ConflictOutcome::AcceptRemote
        );
    }

    #[test]
    fn manual_policy_parks() {
        let op = update(json!({"priority": "high"}), 3_000);
        let doc = remote(json!({"priority": "medium"}), 2_000);

        assert_eq!(
            resolve_conflict(ConflictPolicy::Manual, &op, None, &doc),
            ConflictOutcome::Manual
        );
    }

    #[test]
    fn later_update_resurrects_remotely_deleted_doc() {
        let shadow = json!({"title": "A", "priority": "low"});
        let op = update(json!({"priority": "high"}), 3_000);
        let mut doc = remote(serde_json::Value::Null, 2_000);
        doc.deleted = true;

        assert_eq!(
            resolve_conflict(ConflictPolicy::FieldMerge, &op, Some(&shadow), &doc),
            ConflictOutcome::Recommit {
                mutation: Mutation::Set(json!({"title": "A", "priority": "high"})),
                resolution: ConflictResolution::LocalWins,
            }
        );
    }
}
