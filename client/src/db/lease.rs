//! Database operations for the shared leader lease row.

use sqlx::SqliteConnection;
use tether_engine::Lease;

use crate::error::Result;

const LEASE_NAME: &str = "sync";

#[derive(Debug, sqlx::FromRow)]
struct StoredLease {
    holder: Option<String>,
    epoch: i64,
    expires_at: i64,
}

/// Read the current lease. A missing row reads as vacant.
pub async fn read_lease(conn: &mut SqliteConnection) -> Result<Lease> {
    let row = sqlx::query_as::<_, StoredLease>(
        "SELECT holder, epoch, expires_at FROM leader_lease WHERE name = ?1",
    )
    .bind(LEASE_NAME)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map_or_else(Lease::vacant, |r| Lease {
        holder: r.holder,
        epoch: r.epoch as u64,
        expires_at: r.expires_at as u64,
    }))
}

/// Replace the lease with `next` only if it still equals `expected`.
///
/// Returns `false` when another tab wrote in between.
pub async fn compare_and_swap(
    conn: &mut SqliteConnection,
    expected: &Lease,
    next: &Lease,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE leader_lease
        SET holder = ?2, epoch = ?3, expires_at = ?4
        WHERE name = ?1 AND holder IS ?5 AND epoch = ?6 AND expires_at = ?7
        "#,
    )
    .bind(LEASE_NAME)
    .bind(next.holder.as_deref())
    .bind(next.epoch as i64)
    .bind(next.expires_at as i64)
    .bind(expected.holder.as_deref())
    .bind(expected.epoch as i64)
    .bind(expected.expires_at as i64)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
