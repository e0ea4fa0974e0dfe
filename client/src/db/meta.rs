//! Database operations for per-collection sync metadata.

use sqlx::SqliteConnection;
use tether_engine::SyncMeta;

use crate::error::Result;

#[derive(Debug, sqlx::FromRow)]
struct StoredMeta {
    collection: String,
    last_synced_at: Option<i64>,
    last_full_resync_at: Option<i64>,
    cursor: Option<i64>,
}

impl From<StoredMeta> for SyncMeta {
    fn from(row: StoredMeta) -> Self {
        SyncMeta {
            collection: row.collection,
            last_synced_at: row.last_synced_at.map(|t| t as u64),
            last_full_resync_at: row.last_full_resync_at.map(|t| t as u64),
            cursor: row.cursor.map(|t| t as u64),
        }
    }
}

/// Load a collection's metadata; a collection never seen before gets fresh
/// metadata.
pub async fn get_meta(conn: &mut SqliteConnection, collection: &str) -> Result<SyncMeta> {
    let row = sqlx::query_as::<_, StoredMeta>(
        "SELECT collection, last_synced_at, last_full_resync_at, cursor \
         FROM sync_meta WHERE collection = ?1",
    )
    .bind(collection)
    .fetch_optional(&mut *conn)
    .await?;
    let meta = row.map_or_else(|| SyncMeta::new(collection), SyncMeta::from);
    Ok(meta)
}

/// List metadata for every collection that has synced at least once.
pub async fn list_meta(conn: &mut SqliteConnection) -> Result<Vec<SyncMeta>> {
    let rows = sqlx::query_as::<_, StoredMeta>(
        "SELECT collection, last_synced_at, last_full_resync_at, cursor \
         FROM sync_meta ORDER BY collection",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(SyncMeta::from).collect())
}

pub async fn put_meta(conn: &mut SqliteConnection, meta: &SyncMeta) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_meta (collection, last_synced_at, last_full_resync_at, cursor)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(collection) DO UPDATE SET
            last_synced_at = excluded.last_synced_at,
            last_full_resync_at = excluded.last_full_resync_at,
            cursor = excluded.cursor
        "#,
    )
    .bind(&meta.collection)
    .bind(meta.last_synced_at.map(|t| t as i64))
    .bind(meta.last_full_resync_at.map(|t| t as i64))
    .bind(meta.cursor.map(|t| t as i64))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Forget that a collection is in sync, forcing a full resnapshot.
pub async fn invalidate(conn: &mut SqliteConnection, collection: &str) -> Result<()> {
    let mut meta = get_meta(conn, collection).await?;
    meta.last_synced_at = None;
    put_meta(conn, &meta).await
}
