//! Database operations for the operation log.
//!
//! Completion writes take the claiming leader's epoch. They only land while
//! the operation is still open and claimed by that epoch, so a reply that
//! arrives after leadership moved on changes nothing.

use std::collections::HashSet;

use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqliteConnection};
use tether_engine::{
    select_batch, Epoch, FailureOutcome, NewOperation, OpKind, OpStatus, Operation, RecordId,
    RetryPolicy, Seq, Timestamp,
};

use crate::error::Result;

const COLUMNS: &str = "seq, op_id, collection, record_id, kind, payload, base_revision, \
                       revision, created_at, status, attempts, last_error, next_attempt_at, \
                       claim_epoch";

/// Statuses an operation can still leave.
const OPEN: &str = "('pending', 'conflicted')";

/// A stored operation row from the database.
#[derive(Debug)]
pub struct StoredOperation {
    pub seq: i64,
    pub op_id: String,
    pub collection: String,
    pub record_id: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub base_revision: Option<String>,
    pub revision: i64,
    pub created_at: i64,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: i64,
    pub claim_epoch: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredOperation {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let payload: Json<serde_json::Value> = row.try_get("payload")?;
        Ok(StoredOperation {
            seq: row.try_get("seq")?,
            op_id: row.try_get("op_id")?,
            collection: row.try_get("collection")?,
            record_id: row.try_get("record_id")?,
            kind: row.try_get("kind")?,
            payload: payload.0,
            base_revision: row.try_get("base_revision")?,
            revision: row.try_get("revision")?,
            created_at: row.try_get("created_at")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            claim_epoch: row.try_get("claim_epoch")?,
        })
    }
}

impl StoredOperation {
    /// Convert database row to an engine operation.
    pub fn to_operation(&self) -> Result<Operation> {
        Ok(Operation {
            seq: self.seq,
            op_id: self.op_id.clone(),
            collection: self.collection.clone(),
            record_id: self.record_id.clone(),
            kind: self.kind.parse()?,
            payload: self.payload.clone(),
            base_revision: self.base_revision.clone(),
            revision: self.revision as u64,
            created_at: self.created_at as u64,
            status: self.status.parse()?,
            attempts: self.attempts as u32,
            last_error: self.last_error.clone(),
            next_attempt_at: self.next_attempt_at as u64,
            claim_epoch: self.claim_epoch.map(|e| e as u64),
        })
    }
}

fn to_operations(rows: Vec<StoredOperation>) -> Result<Vec<Operation>> {
    rows.iter().map(StoredOperation::to_operation).collect()
}

/// Append an operation to the log and return its sequence number.
pub async fn append(conn: &mut SqliteConnection, op: &NewOperation) -> Result<Seq> {
    let result = sqlx::query(
        r#"
        INSERT INTO operations (
            op_id, collection, record_id, kind, payload, base_revision, revision, created_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&op.op_id)
    .bind(&op.collection)
    .bind(&op.record_id)
    .bind(op.kind.as_str())
    .bind(Json(&op.payload))
    .bind(op.base_revision.as_deref())
    .bind(op.revision as i64)
    .bind(op.created_at as i64)
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Get a single operation.
pub async fn get_operation(conn: &mut SqliteConnection, seq: Seq) -> Result<Option<Operation>> {
    let sql = format!("SELECT {COLUMNS} FROM operations WHERE seq = ?1");
    let row = sqlx::query_as::<_, StoredOperation>(&sql)
        .bind(seq)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| r.to_operation()).transpose()
}

/// Operations that have not reached a terminal status, oldest first.
pub async fn open_operations(
    conn: &mut SqliteConnection,
    collection: Option<&str>,
) -> Result<Vec<Operation>> {
    let sql = format!(
        "SELECT {COLUMNS} FROM operations \
         WHERE status IN {OPEN} AND (?1 IS NULL OR collection = ?1) ORDER BY seq"
    );
    let rows = sqlx::query_as::<_, StoredOperation>(&sql)
        .bind(collection)
        .fetch_all(&mut *conn)
        .await?;
    to_operations(rows)
}

/// Operations with the given status, oldest first.
pub async fn by_status(conn: &mut SqliteConnection, status: OpStatus) -> Result<Vec<Operation>> {
    let sql = format!("SELECT {COLUMNS} FROM operations WHERE status = ?1 ORDER BY seq");
    let rows = sqlx::query_as::<_, StoredOperation>(&sql)
        .bind(status.as_str())
        .fetch_all(&mut *conn)
        .await?;
    to_operations(rows)
}

/// The next dispatchable operations, at most one per record.
pub async fn next_batch(
    conn: &mut SqliteConnection,
    collection: Option<&str>,
    limit: usize,
    now: Timestamp,
) -> Result<Vec<Operation>> {
    let open = open_operations(conn, collection).await?;
    Ok(select_batch(open, now, limit))
}

/// Whether the record has any operation that is not terminal yet.
pub async fn has_open(
    conn: &mut SqliteConnection,
    collection: &str,
    record_id: &str,
) -> Result<bool> {
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM operations \
         WHERE collection = ?1 AND record_id = ?2 AND status IN {OPEN})"
    );
    let exists: bool = sqlx::query_scalar(&sql)
        .bind(collection)
        .bind(record_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(exists)
}

/// Ids of records in `collection` with open operations.
pub async fn open_record_ids(
    conn: &mut SqliteConnection,
    collection: &str,
) -> Result<HashSet<RecordId>> {
    let sql = format!(
        "SELECT DISTINCT record_id FROM operations WHERE collection = ?1 AND status IN {OPEN}"
    );
    let ids: Vec<String> = sqlx::query_scalar(&sql)
        .bind(collection)
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids.into_iter().collect())
}

/// Number of operations waiting to be dispatched.
pub async fn pending_count(conn: &mut SqliteConnection) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM operations WHERE status = 'pending'")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as u64)
}

/// Tag a pending operation with the epoch of the leader dispatching it.
pub async fn claim(conn: &mut SqliteConnection, seq: Seq, epoch: Epoch) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE operations SET claim_epoch = ?2 WHERE seq = ?1 AND status = 'pending'",
    )
    .bind(seq)
    .bind(epoch as i64)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Move an open operation to a terminal or parked status.
///
/// With `epoch` set, the write only lands if that epoch still holds the claim.
pub async fn finish(
    conn: &mut SqliteConnection,
    seq: Seq,
    status: OpStatus,
    error: Option<&str>,
    epoch: Option<Epoch>,
) -> Result<bool> {
    let sql = format!(
        "UPDATE operations SET status = ?2, last_error = COALESCE(?3, last_error) \
         WHERE seq = ?1 AND status IN {OPEN} AND (?4 IS NULL OR claim_epoch = ?4)"
    );
    let result = sqlx::query(&sql)
        .bind(seq)
        .bind(status.as_str())
        .bind(error)
        .bind(epoch.map(|e| e as i64))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Count a failed attempt, scheduling a retry or dead-lettering the operation.
///
/// Returns `None` when the operation is no longer open or claimed by `epoch`.
pub async fn record_failure(
    conn: &mut SqliteConnection,
    seq: Seq,
    error: &str,
    policy: &RetryPolicy,
    now: Timestamp,
    epoch: Option<Epoch>,
) -> Result<Option<FailureOutcome>> {
    let Some(op) = get_operation(conn, seq).await? else {
        return Ok(None);
    };
    if op.status != OpStatus::Pending {
        return Ok(None);
    }

    let outcome = policy.on_failure(op.attempts, now);
    let (status, attempts, next_attempt_at) = match outcome {
        FailureOutcome::Retry {
            attempts,
            next_attempt_at,
        } => (OpStatus::Pending, attempts, next_attempt_at),
        FailureOutcome::DeadLetter { attempts } => {
            (OpStatus::DeadLettered, attempts, op.next_attempt_at)
        }
    };

    let result = sqlx::query(
        r#"
        UPDATE operations
        SET status = ?2, attempts = ?3, next_attempt_at = ?4, last_error = ?5
        WHERE seq = ?1 AND status = 'pending' AND (?6 IS NULL OR claim_epoch = ?6)
        "#,
    )
    .bind(seq)
    .bind(status.as_str())
    .bind(attempts as i64)
    .bind(next_attempt_at as i64)
    .bind(error)
    .bind(epoch.map(|e| e as i64))
    .execute(&mut *conn)
    .await?;

    Ok((result.rows_affected() == 1).then_some(outcome))
}

/// Replace what a pending operation will commit, after a conflict was
/// resolved in its favour. It becomes due immediately.
pub async fn rewrite(
    conn: &mut SqliteConnection,
    op: &Operation,
    kind: OpKind,
    payload: &serde_json::Value,
    base_revision: &str,
    epoch: Option<Epoch>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET kind = ?2, payload = ?3, base_revision = ?4, next_attempt_at = 0
        WHERE seq = ?1 AND status = 'pending' AND (?5 IS NULL OR claim_epoch = ?5)
        "#,
    )
    .bind(op.seq)
    .bind(kind.as_str())
    .bind(Json(payload))
    .bind(base_revision)
    .bind(epoch.map(|e| e as i64))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Park an operation on a conflict someone has to resolve by hand. Its base
/// moves to the remote revision it lost against.
pub async fn park_conflict(
    conn: &mut SqliteConnection,
    seq: Seq,
    remote_revision: &str,
    epoch: Option<Epoch>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET status = 'conflicted', base_revision = ?2, last_error = 'revision conflict'
        WHERE seq = ?1 AND status = 'pending' AND (?3 IS NULL OR claim_epoch = ?3)
        "#,
    )
    .bind(seq)
    .bind(remote_revision)
    .bind(epoch.map(|e| e as i64))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Put a dead-lettered or conflicted operation back in the queue with a
/// fresh attempt budget.
pub async fn reopen(conn: &mut SqliteConnection, seq: Seq, from: OpStatus) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE operations
        SET status = 'pending', attempts = 0, next_attempt_at = 0, claim_epoch = NULL
        WHERE seq = ?1 AND status = ?2
        "#,
    )
    .bind(seq)
    .bind(from.as_str())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Give up on a parked or dead-lettered operation.
pub async fn discard(conn: &mut SqliteConnection, seq: Seq, reason: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE operations SET status = 'discarded', last_error = ?2
        WHERE seq = ?1 AND status IN ('conflicted', 'dead_lettered')
        "#,
    )
    .bind(seq)
    .bind(reason)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Point later open operations on a record at a new remote revision.
pub async fn rebase_open(
    conn: &mut SqliteConnection,
    collection: &str,
    record_id: &str,
    after_seq: Seq,
    revision: &str,
) -> Result<u64> {
    let sql = format!(
        "UPDATE operations SET base_revision = ?4 \
         WHERE collection = ?1 AND record_id = ?2 AND seq > ?3 AND status IN {OPEN}"
    );
    let result = sqlx::query(&sql)
        .bind(collection)
        .bind(record_id)
        .bind(after_seq)
        .bind(revision)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Move every operation of a record to a new id.
pub async fn rekey(
    conn: &mut SqliteConnection,
    collection: &str,
    from: &str,
    to: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE operations SET record_id = ?3 WHERE collection = ?1 AND record_id = ?2",
    )
    .bind(collection)
    .bind(from)
    .bind(to)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, run_migrations, Pool};
    use serde_json::json;

    async fn setup() -> Pool {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    fn update(n: u64, record: &str) -> NewOperation {
        NewOperation::update(
            format!("op-{record}-{n}"),
            "tasks",
            record,
            json!({"n": n}),
            Some("r1".into()),
            n,
            1_000 + n,
        )
    }

    #[tokio::test]
    async fn append_assigns_increasing_seq() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let first = append(&mut conn, &update(1, "t1")).await.unwrap();
        let second = append(&mut conn, &update(2, "t1")).await.unwrap();
        assert!(second > first);

        let op = get_operation(&mut conn, first).await.unwrap().unwrap();
        assert_eq!(op.kind, OpKind::Update);
        assert_eq!(op.status, OpStatus::Pending);
        assert_eq!(op.payload, json!({"n": 1}));
        assert_eq!(op.base_revision.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn batch_holds_back_later_ops_on_same_record() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let a1 = append(&mut conn, &update(1, "a")).await.unwrap();
        let a2 = append(&mut conn, &update(2, "a")).await.unwrap();
        let b1 = append(&mut conn, &update(1, "b")).await.unwrap();

        let batch = next_batch(&mut conn, None, 10, 5_000).await.unwrap();
        let seqs: Vec<_> = batch.iter().map(|op| op.seq).collect();
        assert_eq!(seqs, vec![a1, b1]);

        let synced = finish(&mut conn, a1, OpStatus::Synced, None, None).await;
        assert!(synced.unwrap());
        let batch = next_batch(&mut conn, None, 10, 5_000).await.unwrap();
        let seqs: Vec<_> = batch.iter().map(|op| op.seq).collect();
        assert_eq!(seqs, vec![a2, b1]);
    }

    #[tokio::test]
    async fn stale_epoch_cannot_complete() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let seq = append(&mut conn, &update(1, "t1")).await.unwrap();

        assert!(claim(&mut conn, seq, 1).await.unwrap());
        assert!(claim(&mut conn, seq, 2).await.unwrap());
        let stale = finish(&mut conn, seq, OpStatus::Synced, None, Some(1)).await;
        assert!(!stale.unwrap());
        let current = finish(&mut conn, seq, OpStatus::Synced, None, Some(2)).await;
        assert!(current.unwrap());
        // Already terminal.
        let again = finish(&mut conn, seq, OpStatus::Discarded, None, Some(2)).await;
        assert!(!again.unwrap());
        assert!(!claim(&mut conn, seq, 3).await.unwrap());
    }

    #[tokio::test]
    async fn failures_back_off_then_dead_letter() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let seq = append(&mut conn, &update(1, "t1")).await.unwrap();
        let policy = RetryPolicy {
            base_ms: 100,
            cap_ms: 1_000,
            max_attempts: 3,
        };

        let first = record_failure(&mut conn, seq, "timeout", &policy, 10_000, None)
            .await
            .unwrap();
        assert_eq!(
            first,
            Some(FailureOutcome::Retry {
                attempts: 1,
                next_attempt_at: 10_200
            })
        );
        let early = next_batch(&mut conn, None, 10, 10_100).await.unwrap();
        assert!(early.is_empty());
        assert_eq!(
            next_batch(&mut conn, None, 10, 10_200).await.unwrap().len(),
            1
        );

        record_failure(&mut conn, seq, "timeout", &policy, 20_000, None)
            .await
            .unwrap();
        let last = record_failure(&mut conn, seq, "timeout", &policy, 30_000, None)
            .await
            .unwrap();
        assert_eq!(last, Some(FailureOutcome::DeadLetter { attempts: 3 }));

        let dead = by_status(&mut conn, OpStatus::DeadLettered).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("timeout"));
        assert_eq!(pending_count(&mut conn).await.unwrap(), 0);

        let reopened = reopen(&mut conn, seq, OpStatus::DeadLettered).await;
        assert!(reopened.unwrap());
        let op = get_operation(&mut conn, seq).await.unwrap().unwrap();
        assert_eq!(op.status, OpStatus::Pending);
        assert_eq!(op.attempts, 0);
    }

    #[tokio::test]
    async fn conflicted_op_blocks_record_but_counts_as_open() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let first = append(&mut conn, &update(1, "t1")).await.unwrap();
        append(&mut conn, &update(2, "t1")).await.unwrap();

        assert!(park_conflict(&mut conn, first, "r7", None).await.unwrap());
        let batch = next_batch(&mut conn, None, 10, 5_000).await.unwrap();
        assert!(batch.is_empty());
        assert!(has_open(&mut conn, "tasks", "t1").await.unwrap());
        assert_eq!(
            open_record_ids(&mut conn, "tasks").await.unwrap(),
            HashSet::from(["t1".to_string()])
        );

        let parked = get_operation(&mut conn, first).await.unwrap().unwrap();
        assert_eq!(parked.base_revision.as_deref(), Some("r7"));
    }

    #[tokio::test]
    async fn rebase_and_rekey() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let create = append(
            &mut conn,
            &NewOperation::create("op-c", "tasks", "local-1", json!({}), 1, 1_000),
        )
        .await
        .unwrap();
        let next = append(&mut conn, &update(2, "local-1")).await.unwrap();

        let rebased = rebase_open(&mut conn, "tasks", "local-1", create, "r1").await;
        assert_eq!(rebased.unwrap(), 1);
        assert_eq!(
            rekey(&mut conn, "tasks", "local-1", "srv-1").await.unwrap(),
            2
        );

        let op = get_operation(&mut conn, next).await.unwrap().unwrap();
        assert_eq!(op.record_id, "srv-1");
        assert_eq!(op.base_revision.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn discard_only_touches_parked_or_dead() {
        let pool = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let pending = append(&mut conn, &update(1, "t1")).await.unwrap();
        let parked = append(&mut conn, &update(1, "t2")).await.unwrap();
        park_conflict(&mut conn, parked, "r2", None).await.unwrap();

        assert!(!discard(&mut conn, pending, "operator").await.unwrap());
        assert!(discard(&mut conn, parked, "operator").await.unwrap());

        let op = get_operation(&mut conn, parked).await.unwrap().unwrap();
        assert_eq!(op.status, OpStatus::Discarded);
        assert_eq!(op.last_error.as_deref(), Some("operator"));
        assert!(!has_open(&mut conn, "tasks", "t2").await.unwrap());
    }
}
