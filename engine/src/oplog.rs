//! Operation log rules: which operations may be dispatched next, and what
//! happens when a dispatch fails.
//!
//! Storage of the log lives in the client crate; these functions decide over
//! whatever slice of it the caller loaded.

use crate::{Operation, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Pick up to `limit` operations that may be dispatched right now.
///
/// Operations are considered in `seq` order. Only the oldest non-terminal
/// operation of each record is a candidate: anything behind it on the same
/// record is withheld until it reaches a terminal outcome, even if the head is
/// in backoff or parked on a conflict. This is what keeps a `create` ahead of
/// its `update` under concurrent dispatch.
pub fn select_batch(mut ops: Vec<Operation>, now: Timestamp, limit: usize) -> Vec<Operation> {
    ops.sort_by_key(|op| op.seq);

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut batch = Vec::new();

    for op in ops {
        if batch.len() >= limit {
            break;
        }
        if op.status.is_terminal() {
            continue;
        }
        let first_for_record = seen.insert((op.collection.clone(), op.record_id.clone()));
        if first_for_record && op.is_due(now) {
            batch.push(op);
        }
    }

    batch
}

/// Capped exponential backoff with a dead-letter threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 60_000,
            max_attempts: 8,
        }
    }
}

/// What to do with an operation after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Try again once `next_attempt_at` has passed
    Retry {
        attempts: u32,
        next_attempt_at: Timestamp,
    },
    /// Give up and keep the operation for inspection
    DeadLetter { attempts: u32 },
}

impl RetryPolicy {
    /// Backoff before the next try after `attempts` failures: `base * 2^attempts`,
    /// capped.
    pub fn delay(&self, attempts: u32) -> u64 {
        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.cap_ms)
    }

    /// Account for one more failed attempt of an operation that had already
    /// failed `previous_attempts` times.
    pub fn on_failure(&self, previous_attempts: u32, now: Timestamp) -> FailureOutcome {
        let attempts = previous_attempts.saturating_add(1);
        if attempts >= self.max_attempts {
            FailureOutcome::DeadLetter { attempts }
        } else {
            FailureOutcome::Retry {
                attempts,
                next_attempt_at: now.saturating_add(self.delay(attempts)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewOperation, OpStatus};
    use serde_json::json;

    fn op(seq: i64, record: &str) -> Operation {
        Operation::from_new(
            seq,
            NewOperation::update(
                format!("op-{seq}"),
                "tasks",
                record,
                json!({"n": seq}),
                None,
                seq as u64,
                1000,
            ),
        )
    }

    fn seqs(batch: &[Operation]) -> Vec<i64> {
        batch.iter().map(|op| op.seq).collect()
    }

    #[test]
    fn one_operation_per_record() {
        let ops = vec![op(1, "a"), op(2, "a"), op(3, "b"), op(4, "b"), op(5, "c")];
        let batch = select_batch(ops, 1000, 10);
        assert_eq!(seqs(&batch), vec![1, 3, 5]);
    }

    #[test]
    fn input_order_does_not_matter() {
        let ops = vec![op(4, "b"), op(2, "a"), op(3, "b"), op(1, "a")];
        let batch = select_batch(ops, 1000, 10);
        assert_eq!(seqs(&batch), vec![1, 3]);
    }

    #[test]
    fn terminal_head_releases_successor() {
        let mut first = op(1, "a");
        first.status = OpStatus::Synced;
        let mut dead = op(2, "a");
        dead.status = OpStatus::DeadLettered;

        let batch = select_batch(vec![first, dead, op(3, "a")], 1000, 10);
        assert_eq!(seqs(&batch), vec![3]);
    }

    #[test]
    fn head_in_backoff_blocks_record() {
        let mut waiting = op(1, "a");
        waiting.next_attempt_at = 9000;

        let batch = select_batch(vec![waiting, op(2, "a"), op(3, "b")], 1000, 10);
        assert_eq!(seqs(&batch), vec![3]);
    }

    #[test]
    fn conflicted_head_blocks_record() {
        let mut parked = op(1, "a");
        parked.status = OpStatus::Conflicted;

        let batch = select_batch(vec![parked, op(2, "a")], 1000, 10);
        assert!(batch.is_empty());
    }

    #[test]
    fn limit_is_respected() {
        let ops = vec![op(1, "a"), op(2, "b"), op(3, "c")];
        let batch = select_batch(ops, 1000, 2);
        assert_eq!(seqs(&batch), vec![1, 2]);
    }

    #[test]
    fn delay_doubles_until_cap() {
        let policy = RetryPolicy {
            base_ms: 100,
            cap_ms: 1_000,
            max_attempts: 10,
        };
        assert_eq!(policy.delay(0), 100);
        assert_eq!(policy.delay(1), 200);
        assert_eq!(policy.delay(3), 800);
        assert_eq!(policy.delay(4), 1_000);
        assert_eq!(policy.delay(200), 1_000);
    }

    #[test]
    fn failure_schedules_retry_then_dead_letters() {
        let policy = RetryPolicy {
            base_ms: 100,
            cap_ms: 10_000,
            max_attempts: 3,
        };

        assert_eq!(
            policy.on_failure(0, 1_000),
            FailureOutcome::Retry {
                attempts: 1,
                next_attempt_at: 1_200
            }
        );
        assert_eq!(
            policy.on_failure(1, 1_000),
            FailureOutcome::Retry {
                attempts: 2,
                next_attempt_at: 1_400
            }
        );
        assert_eq!(
            policy.on_failure(2, 1_000),
            FailureOutcome::DeadLetter { attempts: 3 }
        );
    }
}
