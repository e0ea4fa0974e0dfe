//! Property tests for the sync rules.
//!
//! These drive the pure engine functions through simulated drains and lease
//! schedules and check the invariants the client relies on.

use proptest::prelude::*;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tether_engine::{
    lease, merge_patch, select_batch, FailureOutcome, Lease, LeaseDecision, Mutation,
    NewOperation, OpStatus, Operation, Record, RemoteDoc, RetryPolicy, Role,
};

fn queued(seq: i64, record: usize) -> Operation {
    Operation::from_new(
        seq,
        NewOperation::update(
            format!("op-{seq}"),
            "tasks",
            format!("t{record}"),
            json!({ "seq": seq }),
            None,
            seq as u64,
            0,
        ),
    )
}

#[derive(Debug, Clone)]
enum Write {
    Create(usize),
    Update(usize, u8),
    Delete(usize),
}

fn write_strategy() -> impl Strategy<Value = Write> {
    prop_oneof![
        (0..3usize).prop_map(Write::Create),
        (0..3usize, 0..5u8).prop_map(|(r, v)| Write::Update(r, v)),
        (0..3usize).prop_map(Write::Delete),
    ]
}

/// Apply a commit to a toy remote store keyed by record id.
fn commit(remote: &mut HashMap<String, serde_json::Value>, op: &Operation) {
    match op.mutation() {
        Mutation::Set(payload) => {
            remote.insert(op.record_id.clone(), payload);
        }
        Mutation::Patch(patch) => {
            let doc = remote
                .entry(op.record_id.clone())
                .or_insert_with(|| json!({}));
            merge_patch(doc, &patch);
        }
        Mutation::Delete => {
            remote.remove(&op.record_id);
        }
    }
}

proptest! {
    #[test]
    fn same_record_never_dispatched_out_of_order(
        records in prop::collection::vec(0..4usize, 1..40),
        outcomes in prop::collection::vec(any::<bool>(), 200),
        limit in 1..6usize,
    ) {
        let policy = RetryPolicy { base_ms: 10, cap_ms: 100, max_attempts: 4 };
        let mut log: Vec<Operation> = records
            .iter()
            .enumerate()
            .map(|(i, r)| queued(i as i64 + 1, *r))
            .collect();
        let mut dispatched: HashMap<String, Vec<i64>> = HashMap::new();
        let mut outcome = outcomes.iter().cycle();
        let mut now = 0u64;

        for _ in 0..500 {
            if log.iter().all(|op| op.status.is_terminal()) {
                break;
            }
            let batch = select_batch(log.clone(), now, limit);
            let distinct: HashSet<_> = batch.iter().map(|op| op.record_id.clone()).collect();
            prop_assert_eq!(distinct.len(), batch.len());

            // Complete in reverse to mimic out-of-order responses.
            for op in batch.iter().rev() {
                dispatched.entry(op.record_id.clone()).or_default().push(op.seq);
                let entry = log.iter_mut().find(|o| o.seq == op.seq).unwrap();
                if *outcome.next().unwrap() {
                    entry.status = OpStatus::Synced;
                    continue;
                }
                match policy.on_failure(entry.attempts, now) {
                    FailureOutcome::Retry { attempts, next_attempt_at } => {
                        entry.attempts = attempts;
                        entry.next_attempt_at = next_attempt_at;
                    }
                    FailureOutcome::DeadLetter { attempts } => {
                        entry.attempts = attempts;
                        entry.status = OpStatus::DeadLettered;
                    }
                }
            }
            now += 50;
        }

        // Nothing is left in limbo.
        prop_assert!(log.iter().all(|op| op.status.is_terminal()));
        for seqs in dispatched.values() {
            prop_assert!(seqs.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn offline_writes_converge_after_drain(
        writes in prop::collection::vec(write_strategy(), 1..30),
        replays in prop::collection::vec(any::<bool>(), 30),
    ) {
        let mut records: HashMap<String, Record> = HashMap::new();
        let mut log: Vec<Operation> = Vec::new();
        let mut now = 1_000u64;

        for write in &writes {
            now += 10;
            let seq = log.len() as i64 + 1;
            let op_id = format!("op-{seq}");
            let new_op = match write {
                Write::Create(r) => {
                    let id = format!("t{r}");
                    if records.contains_key(&id) {
                        continue;
                    }
                    let record = Record::new_local("tasks", &id, json!({"v": 0}), now);
                    let payload = record.payload.clone();
                    let op = NewOperation::create(op_id, "tasks", &id, payload, 1, now);
                    records.insert(id, record);
                    op
                }
                Write::Update(r, v) => {
                    let id = format!("t{r}");
                    let Some(record) = records.get_mut(&id) else { continue };
                    let patch = json!({ "v": v });
                    if record.apply_patch(&patch, now).is_err() {
                        continue;
                    }
                    let revision = record.local_revision;
                    NewOperation::update(op_id, "tasks", &id, patch, None, revision, now)
                }
                Write::Delete(r) => {
                    let id = format!("t{r}");
                    let Some(record) = records.get_mut(&id) else { continue };
                    if record.mark_deleted(now).is_err() {
                        continue;
                    }
                    NewOperation::delete(op_id, "tasks", &id, None, record.local_revision, now)
                }
            };
            log.push(Operation::from_new(seq, new_op));
        }

        let expected: HashMap<String, serde_json::Value> = records
            .values()
            .filter(|r| r.is_active())
            .map(|r| (r.id.clone(), r.payload.clone()))
            .collect();

        let mut remote: HashMap<String, serde_json::Value> = HashMap::new();
        let mut revision = 0u64;
        let mut replay = replays.iter().cycle();
        loop {
            let batch = select_batch(log.clone(), now, 4);
            if batch.is_empty() {
                break;
            }
            for op in batch {
                commit(&mut remote, &op);
                // A crash between the remote ack and the log update replays
                // the same commit.
                if *replay.next().unwrap() {
                    commit(&mut remote, &op);
                }
                revision += 1;
                let doc = RemoteDoc {
                    collection: "tasks".into(),
                    id: op.record_id.clone(),
                    payload: remote.get(&op.record_id).cloned().unwrap_or(serde_json::Value::Null),
                    revision: format!("r{revision}"),
                    updated_at: now,
                    deleted: !remote.contains_key(&op.record_id),
                };
                if doc.deleted {
                    records.remove(&op.record_id);
                } else if let Some(record) = records.get_mut(&op.record_id) {
                    record.acknowledge(&doc, op.revision);
                }
                log.iter_mut().find(|o| o.seq == op.seq).unwrap().status = OpStatus::Synced;
            }
        }

        prop_assert_eq!(&remote, &expected);
        let local: HashMap<String, serde_json::Value> = records
            .values()
            .map(|r| (r.id.clone(), r.payload.clone()))
            .collect();
        prop_assert_eq!(&local, &expected);
        prop_assert!(records.values().all(|r| !r.has_unsynced()));
    }

    #[test]
    fn at_most_one_leader_and_lapsed_lease_is_taken_over(
        starts in prop::collection::vec(0..2_000u64, 2..6),
        periods in prop::collection::vec(200..1_500u64, 6),
        crash_at in 1_000..8_000u64,
    ) {
        let ttl = 3_000;
        let n = starts.len();
        let mut shared = Lease::vacant();
        let mut roles = vec![Role::Follower { holder: None }; n];
        let mut next_tick = starts.clone();
        let mut alive = vec![true; n];
        let mut crashed_at: Option<u64> = None;
        let mut taken_over_at: Option<u64> = None;

        for now in (0..14_000u64).step_by(10) {
            if crashed_at.is_none() && now >= crash_at {
                if let Some(i) = (0..n).find(|&i| alive[i] && roles[i].is_leader_at(now)) {
                    alive[i] = false;
                    crashed_at = Some(now);
                }
            }

            for i in 0..n {
                if !alive[i] || next_tick[i] > now {
                    continue;
                }
                next_tick[i] = now + periods[i];
                roles[i] = match lease::decide(&shared, &format!("tab-{i}"), now, ttl) {
                    LeaseDecision::Renew(next) | LeaseDecision::Acquire(next) => {
                        let role = Role::Leader { epoch: next.epoch, expires_at: next.expires_at };
                        shared = next;
                        role
                    }
                    LeaseDecision::Held { holder, .. } => Role::Follower { holder: Some(holder) },
                };
                if crashed_at.is_some() && taken_over_at.is_none() && roles[i].is_leader_at(now) {
                    taken_over_at = Some(now);
                }
            }

            let leaders = (0..n).filter(|&i| alive[i] && roles[i].is_leader_at(now)).count();
            prop_assert!(leaders <= 1, "{} leaders at {}", leaders, now);
        }

        if let Some(crash) = crashed_at {
            let taken = taken_over_at.expect("a surviving tab takes over");
            // Lease timeout plus one renewal period, at 10ms resolution.
            prop_assert!(taken - crash <= ttl + 1_500 + 20);
        }
    }
}
