//! Database operations for the per-collection record tables.
//!
//! Each collection gets its own `records_<name>` table. Table and field names
//! come from a validated [`CollectionDef`], so they are safe to splice into SQL.

use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqliteConnection};
use tether_engine::{CollectionDef, IndexDef, Record};

use crate::error::Result;

const COLUMNS: &str = "id, payload, remote_revision, local_revision, synced_revision, \
                       remote_payload, updated_at, tombstone";

/// A stored record row from the database.
#[derive(Debug)]
pub struct StoredRecord {
    pub id: String,
    pub payload: serde_json::Value,
    pub remote_revision: Option<String>,
    pub local_revision: i64,
    pub synced_revision: i64,
    pub remote_payload: Option<serde_json::Value>,
    pub updated_at: i64,
    pub tombstone: bool,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredRecord {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let payload: Json<serde_json::Value> = row.try_get("payload")?;
        let remote_payload: Option<Json<serde_json::Value>> = row.try_get("remote_payload")?;
        Ok(StoredRecord {
            id: row.try_get("id")?,
            payload: payload.0,
            remote_revision: row.try_get("remote_revision")?,
            local_revision: row.try_get("local_revision")?,
            synced_revision: row.try_get("synced_revision")?,
            remote_payload: remote_payload.map(|p| p.0),
            updated_at: row.try_get("updated_at")?,
            tombstone: row.try_get("tombstone")?,
        })
    }
}

impl StoredRecord {
    /// Convert a row into an engine record belonging to `collection`.
    pub fn into_record(self, collection: &str) -> Record {
        Record {
            collection: collection.to_string(),
            id: self.id,
            payload: self.payload,
            remote_revision: self.remote_revision,
            local_revision: self.local_revision as u64,
            synced_revision: self.synced_revision as u64,
            remote_payload: self.remote_payload,
            updated_at: self.updated_at as u64,
            tombstone: self.tombstone,
        }
    }
}

/// Create the collection's table and its expression indices.
pub async fn ensure_table(conn: &mut SqliteConnection, def: &CollectionDef) -> Result<()> {
    def.validate()?;
    let table = def.table_name();

    let create = format!(
        r#"
        CREATE TABLE IF NOT EXISTS "{table}" (
            id TEXT PRIMARY KEY NOT NULL,
            payload TEXT NOT NULL,
            remote_revision TEXT,
            local_revision INTEGER NOT NULL DEFAULT 0,
            synced_revision INTEGER NOT NULL DEFAULT 0,
            remote_payload TEXT,
            updated_at INTEGER NOT NULL,
            tombstone INTEGER NOT NULL DEFAULT 0
        )
        "#
    );
    sqlx::query(&create).execute(&mut *conn).await?;

    for index in &def.indexes {
        let sql = format!(
            r#"CREATE INDEX IF NOT EXISTS "idx_{}_{}" ON "{table}" ({})"#,
            def.name,
            index.name,
            extract_expr(index)
        );
        sqlx::query(&sql).execute(&mut *conn).await?;
    }

    Ok(())
}

fn extract_expr(index: &IndexDef) -> String {
    format!("json_extract(payload, '$.{}')", index.field)
}

/// Get a record by id, tombstones included.
pub async fn get_record(
    conn: &mut SqliteConnection,
    def: &CollectionDef,
    id: &str,
) -> Result<Option<Record>> {
    let sql = format!(
        r#"SELECT {COLUMNS} FROM "{}" WHERE id = ?1"#,
        def.table_name()
    );
    let row = sqlx::query_as::<_, StoredRecord>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|r| r.into_record(&def.name)))
}

/// List records ordered by id.
pub async fn list_records(
    conn: &mut SqliteConnection,
    def: &CollectionDef,
    include_tombstones: bool,
) -> Result<Vec<Record>> {
    let filter = if include_tombstones {
        ""
    } else {
        "WHERE tombstone = 0"
    };
    let sql = format!(
        r#"SELECT {COLUMNS} FROM "{}" {filter} ORDER BY id"#,
        def.table_name()
    );
    let rows = sqlx::query_as::<_, StoredRecord>(&sql)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|r| r.into_record(&def.name)).collect())
}

/// Upsert a record. Returns `false` without writing when the stored row is
/// already identical.
pub async fn put_record(
    conn: &mut SqliteConnection,
    def: &CollectionDef,
    record: &Record,
) -> Result<bool> {
    if let Some(existing) = get_record(conn, def, &record.id).await? {
        if existing == *record {
            return Ok(false);
        }
    }

    let sql = format!(
        r#"
        INSERT INTO "{}" ({COLUMNS})
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            remote_revision = excluded.remote_revision,
            local_revision = excluded.local_revision,
            synced_revision = excluded.synced_revision,
            remote_payload = excluded.remote_payload,
            updated_at = excluded.updated_at,
            tombstone = excluded.tombstone
        "#,
        def.table_name()
    );
    sqlx::query(&sql)
        .bind(&record.id)
        .bind(Json(&record.payload))
        .bind(record.remote_revision.as_deref())
        .bind(record.local_revision as i64)
        .bind(record.synced_revision as i64)
        .bind(record.remote_payload.as_ref().map(Json))
        .bind(record.updated_at as i64)
        .bind(record.tombstone)
        .execute(&mut *conn)
        .await?;
    bump_version(conn, &def.name).await?;

    Ok(true)
}

/// Physically remove a record. Returns whether a row existed.
pub async fn delete_record(
    conn: &mut SqliteConnection,
    def: &CollectionDef,
    id: &str,
) -> Result<bool> {
    let sql = format!(r#"DELETE FROM "{}" WHERE id = ?1"#, def.table_name());
    let result = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
    let deleted = result.rows_affected() > 0;
    if deleted {
        bump_version(conn, &def.name).await?;
    }
    Ok(deleted)
}

/// Move a record to a new id, as when the remote assigns its own id to a
/// locally created document.
pub async fn rename_record(
    conn: &mut SqliteConnection,
    def: &CollectionDef,
    from: &str,
    to: &str,
) -> Result<bool> {
    let sql = format!(r#"UPDATE "{}" SET id = ?2 WHERE id = ?1"#, def.table_name());
    let result = sqlx::query(&sql)
        .bind(from)
        .bind(to)
        .execute(&mut *conn)
        .await?;
    let renamed = result.rows_affected() > 0;
    if renamed {
        bump_version(conn, &def.name).await?;
    }
    Ok(renamed)
}

async fn bump_version(conn: &mut SqliteConnection, collection: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO collection_versions (collection, version) VALUES (?1, 1)
        ON CONFLICT(collection) DO UPDATE SET version = version + 1
        "#,
    )
    .bind(collection)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// The collection's change counter, `0` before its first write.
pub async fn collection_version(conn: &mut SqliteConnection, collection: &str) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar(
        "SELECT version FROM collection_versions WHERE collection = ?1",
    )
    .bind(collection)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(version.unwrap_or(0))
}

/// Find live records whose indexed field equals `value`.
///
/// Objects and arrays never match, since indexed fields only hold scalars.
pub async fn query_by_index(
    conn: &mut SqliteConnection,
    def: &CollectionDef,
    index: &IndexDef,
    value: &serde_json::Value,
) -> Result<Vec<Record>> {
    use serde_json::Value;

    let base = format!(
        r#"SELECT {COLUMNS} FROM "{}" WHERE tombstone = 0 AND {}"#,
        def.table_name(),
        extract_expr(index)
    );
    let is_null = format!("{base} IS NULL ORDER BY id");
    let equals = format!("{base} = ?1 ORDER BY id");

    let query = match value {
        Value::Null => sqlx::query_as::<_, StoredRecord>(&is_null),
        Value::Bool(b) => sqlx::query_as(&equals).bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => sqlx::query_as(&equals).bind(i),
            None => sqlx::query_as(&equals).bind(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => sqlx::query_as(&equals).bind(s.as_str()),
        Value::Array(_) | Value::Object(_) => return Ok(Vec::new()),
    };

    let rows = query.fetch_all(&mut *conn).await?;
    Ok(rows.into_iter().map(|r| r.into_record(&def.name)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_memory_pool, run_migrations};
    use serde_json::json;
    use tether_engine::RemoteDoc;

    async fn setup() -> (crate::db::Pool, CollectionDef) {
        let pool = create_memory_pool().await.unwrap();
        run_migrations(&pool).await.unwrap();
        let def = CollectionDef::new("tasks")
            .with_index("batch")
            .with_index("done");
        let mut conn = pool.acquire().await.unwrap();
        ensure_table(&mut conn, &def).await.unwrap();
        drop(conn);
        (pool, def)
    }

    #[tokio::test]
    async fn put_get_roundtrip() {
        let (pool, def) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let mut record = Record::from_remote(&RemoteDoc {
            collection: "tasks".into(),
            id: "t1".into(),
            payload: json!({"title": "Essay", "batch": "2024"}),
            revision: "r3".into(),
            updated_at: 1_000,
            deleted: false,
        });
        record.apply_patch(&json!({"title": "Essay v2"}), 2_000).unwrap();

        assert!(put_record(&mut conn, &def, &record).await.unwrap());
        let loaded = get_record(&mut conn, &def, "t1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn identical_put_is_noop() {
        let (pool, def) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let record = Record::new_local("tasks", "t1", json!({"title": "A"}), 1_000);

        assert!(put_record(&mut conn, &def, &record).await.unwrap());
        assert!(!put_record(&mut conn, &def, &record).await.unwrap());
    }

    #[tokio::test]
    async fn tombstones_hidden_from_listing() {
        let (pool, def) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let live = Record::new_local("tasks", "a", json!({}), 1);
        let mut dead = Record::new_local("tasks", "b", json!({}), 1);
        dead.mark_deleted(2).unwrap();
        put_record(&mut conn, &def, &live).await.unwrap();
        put_record(&mut conn, &def, &dead).await.unwrap();

        assert_eq!(list_records(&mut conn, &def, false).await.unwrap().len(), 1);
        assert_eq!(list_records(&mut conn, &def, true).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn index_query_matches_scalars() {
        let (pool, def) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let rows = [
            ("a", json!("2024"), true),
            ("b", json!(2024), false),
            ("c", json!("2024"), false),
        ];
        for (id, batch, done) in rows {
            let record = Record::new_local("tasks", id, json!({"batch": batch, "done": done}), 1);
            put_record(&mut conn, &def, &record).await.unwrap();
        }
        let by_batch = def.index("batch").unwrap().clone();
        let by_done = def.index("done").unwrap().clone();

        let strings = query_by_index(&mut conn, &def, &by_batch, &json!("2024")).await.unwrap();
        let ids: Vec<_> = strings.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let numbers = query_by_index(&mut conn, &def, &by_batch, &json!(2024)).await.unwrap();
        assert_eq!(numbers.len(), 1);
        assert_eq!(numbers[0].id, "b");

        let done = query_by_index(&mut conn, &def, &by_done, &json!(true)).await.unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, "a");

        let nested = query_by_index(&mut conn, &def, &by_batch, &json!({"x": 1})).await.unwrap();
        assert!(nested.is_empty());
    }

    #[tokio::test]
    async fn rename_and_delete() {
        let (pool, def) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        let record = Record::new_local("tasks", "local-1", json!({}), 1);
        put_record(&mut conn, &def, &record).await.unwrap();

        let renamed = rename_record(&mut conn, &def, "local-1", "srv-9").await;
        assert!(renamed.unwrap());
        let old = get_record(&mut conn, &def, "local-1").await.unwrap();
        assert!(old.is_none());
        assert!(delete_record(&mut conn, &def, "srv-9").await.unwrap());
        assert!(!delete_record(&mut conn, &def, "srv-9").await.unwrap());
    }

    #[tokio::test]
    async fn writes_bump_collection_version() {
        let (pool, def) = setup().await;
        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(collection_version(&mut conn, "tasks").await.unwrap(), 0);

        let record = Record::new_local("tasks", "a", json!({"title": "A"}), 1);
        put_record(&mut conn, &def, &record).await.unwrap();
        assert_eq!(collection_version(&mut conn, "tasks").await.unwrap(), 1);

        // Identical puts and missing rows leave the counter alone.
        put_record(&mut conn, &def, &record).await.unwrap();
        delete_record(&mut conn, &def, "missing").await.unwrap();
        assert_eq!(collection_version(&mut conn, "tasks").await.unwrap(), 1);

        rename_record(&mut conn, &def, "a", "b").await.unwrap();
        delete_record(&mut conn, &def, "b").await.unwrap();
        assert_eq!(collection_version(&mut conn, "tasks").await.unwrap(), 3);
        let untouched = collection_version(&mut conn, "studentProgress").await;
        assert_eq!(untouched.unwrap(), 0);
    }
}
