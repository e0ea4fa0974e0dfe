//! Database module for SQLite persistence.
//!
//! The free functions in the submodules take a `&mut SqliteConnection` so they
//! compose inside a transaction. [`Db`] wraps the pool and the schema and
//! exposes the store's public contract on top of them.

pub mod lease;
pub mod meta;
pub mod operations;
mod pool;
pub mod records;

pub use pool::*;

use std::path::Path;
use std::sync::Arc;

use sqlx::{Sqlite, Transaction};
use tether_engine::{
    CollectionDef, Epoch, FailureOutcome, NewOperation, OpStatus, Operation, Record, RetryPolicy,
    Schema, Seq, SyncMeta, Timestamp,
};

use crate::error::{Error, Result};

/// Handle to the local database shared by every component of a tab.
///
/// Cloning is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct Db {
    pool: Pool,
    schema: Arc<Schema>,
}

impl Db {
    /// Open the database at a `sqlite:` URL, run migrations and create the
    /// collection tables.
    pub async fn open(database_url: &str, schema: Schema) -> Result<Self> {
        let pool = create_pool(database_url).await?;
        Self::init(pool, schema).await
    }

    /// Open a database file.
    pub async fn open_file(path: &Path, schema: Schema) -> Result<Self> {
        let pool = create_file_pool(path).await?;
        Self::init(pool, schema).await
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory(schema: Schema) -> Result<Self> {
        let pool = create_memory_pool().await?;
        Self::init(pool, schema).await
    }

    async fn init(pool: Pool, schema: Schema) -> Result<Self> {
        schema.validate()?;
        run_migrations(&pool).await?;

        let mut conn = pool.acquire().await?;
        for def in schema.collections.values() {
            records::ensure_table(&mut conn, def).await?;
        }
        drop(conn);

        tracing::debug!(
            collections = schema.collections.len(),
            version = schema.version,
            "Local store ready"
        );

        Ok(Self {
            pool,
            schema: Arc::new(schema),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Look up a collection definition.
    pub fn collection(&self, name: &str) -> Result<&CollectionDef> {
        Ok(self.schema.get_collection(name)?)
    }

    /// Start a write transaction.
    ///
    /// The write lock is taken at `BEGIN`, so a transaction that reads before
    /// it writes waits on another tab's writer instead of failing to upgrade.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Counter bumped by every record write to `collection`, from any tab.
    pub async fn change_version(&self, collection: &str) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        records::collection_version(&mut conn, collection).await
    }

    // ------------------------------------------------------------------
    // Local store
    // ------------------------------------------------------------------

    /// Get a record, tombstones included.
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let def = self.collection(collection)?;
        let mut conn = self.pool.acquire().await?;
        records::get_record(&mut conn, def, id).await
    }

    /// All live records of a collection.
    pub async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let def = self.collection(collection)?;
        let mut conn = self.pool.acquire().await?;
        records::list_records(&mut conn, def, false).await
    }

    /// Upsert a record. Returns whether anything changed.
    pub async fn put(&self, record: &Record) -> Result<bool> {
        let def = self.collection(&record.collection)?;
        let mut conn = self.pool.acquire().await?;
        records::put_record(&mut conn, def, record).await
    }

    /// Physically remove a record.
    pub async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        let def = self.collection(collection)?;
        let mut conn = self.pool.acquire().await?;
        records::delete_record(&mut conn, def, id).await
    }

    /// Live records whose indexed field equals `value`.
    pub async fn query_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<Record>> {
        let def = self.collection(collection)?;
        let index = def.index(index)?;
        let mut conn = self.pool.acquire().await?;
        records::query_by_index(&mut conn, def, index, value).await
    }

    // ------------------------------------------------------------------
    // Operation log
    // ------------------------------------------------------------------

    /// Append an operation on its own. Local writes go through
    /// [`crate::SyncClient`], which appends in the same transaction as the
    /// record write.
    pub async fn append(&self, op: &NewOperation) -> Result<Seq> {
        self.collection(&op.collection)?;
        let mut conn = self.pool.acquire().await?;
        operations::append(&mut conn, op).await
    }

    pub async fn operation(&self, seq: Seq) -> Result<Operation> {
        let mut conn = self.pool.acquire().await?;
        operations::get_operation(&mut conn, seq)
            .await?
            .ok_or(Error::OperationNotFound(seq))
    }

    /// The oldest dispatchable operations, at most one per record.
    pub async fn next_batch(
        &self,
        collection: Option<&str>,
        limit: usize,
        now: Timestamp,
    ) -> Result<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        operations::next_batch(&mut conn, collection, limit, now).await
    }

    pub async fn claim(&self, seq: Seq, epoch: Epoch) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        operations::claim(&mut conn, seq, epoch).await
    }

    pub async fn mark_synced(&self, seq: Seq) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        operations::finish(&mut conn, seq, OpStatus::Synced, None, None).await
    }

    /// Count a failed attempt against `policy`.
    pub async fn mark_failed(
        &self,
        seq: Seq,
        error: &str,
        policy: &RetryPolicy,
        now: Timestamp,
    ) -> Result<Option<FailureOutcome>> {
        let mut conn = self.pool.acquire().await?;
        operations::record_failure(&mut conn, seq, error, policy, now, None).await
    }

    pub async fn dead_letter(&self, seq: Seq, error: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        operations::finish(&mut conn, seq, OpStatus::DeadLettered, Some(error), None).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        operations::by_status(&mut conn, OpStatus::DeadLettered).await
    }

    pub async fn conflicts(&self) -> Result<Vec<Operation>> {
        let mut conn = self.pool.acquire().await?;
        operations::by_status(&mut conn, OpStatus::Conflicted).await
    }

    pub async fn pending_count(&self) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        operations::pending_count(&mut conn).await
    }

    pub async fn has_pending(&self, collection: &str, id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        operations::has_open(&mut conn, collection, id).await
    }

    // ------------------------------------------------------------------
    // Sync meta and lease
    // ------------------------------------------------------------------

    pub async fn meta(&self, collection: &str) -> Result<SyncMeta> {
        let mut conn = self.pool.acquire().await?;
        meta::get_meta(&mut conn, collection).await
    }

    pub async fn put_meta(&self, meta: &SyncMeta) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        meta::put_meta(&mut conn, meta).await
    }

    pub async fn all_meta(&self) -> Result<Vec<SyncMeta>> {
        let mut conn = self.pool.acquire().await?;
        meta::list_meta(&mut conn).await
    }

    pub async fn lease(&self) -> Result<tether_engine::Lease> {
        let mut conn = self.pool.acquire().await?;
        lease::read_lease(&mut conn).await
    }
}
