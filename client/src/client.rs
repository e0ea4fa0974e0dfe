//! The UI-facing API.
//!
//! Writes land in the local store and the operation log in one transaction
//! and return immediately; the sync coordinator ships them later. Reads only
//! ever touch the local store.

use std::sync::Arc;
use std::time::Duration;

use tether_engine::{
    Clock, CollectionDef, CollectionName, NewOperation, OpStatus, Operation, Record, RecordId,
    Schema, Seq, TabId,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::bus::ChangeBus;
use crate::clock::SystemClock;
use crate::config::{Config, SyncConfig};
use crate::connectivity::Connectivity;
use crate::coordinator::{rollback_record, SyncCoordinator};
use crate::db::{self, Db};
use crate::error::{Error, Result};
use crate::events::SyncEvent;
use crate::remote::RemoteStore;

/// How an operator settles a parked conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// Send the local write again on top of the remote revision
    KeepLocal,
    /// Drop the local write and show the remote state
    KeepRemote,
}

/// One tab's handle to the local store.
#[derive(Debug, Clone)]
pub struct SyncClient {
    db: Db,
    bus: Arc<ChangeBus>,
    clock: Arc<dyn Clock>,
    tab_id: TabId,
    poll_interval: Duration,
}

impl SyncClient {
    /// Tabs sharing `bus` see each other's writes at once. Tabs that only
    /// share the database file see them within the poll interval.
    pub fn new(
        db: Db,
        bus: Arc<ChangeBus>,
        clock: Arc<dyn Clock>,
        tab_id: impl Into<TabId>,
    ) -> Self {
        Self {
            db,
            bus,
            clock,
            tab_id: tab_id.into(),
            poll_interval: SyncConfig::default().poll_interval(),
        }
    }

    /// Open the database named by `config` with the system clock.
    pub async fn open(config: &Config, schema: Schema) -> Result<Self> {
        let db = Db::open(&config.database_url, schema).await?;
        let client = Self::new(
            db,
            ChangeBus::new_shared(),
            Arc::new(SystemClock),
            config.tab_id.clone(),
        );
        Ok(client.with_poll_interval(config.sync.poll_interval()))
    }

    /// How often subscriptions check the database for writes made by tabs
    /// on another bus.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// A handle for reading and writing one collection.
    pub fn collection(&self, name: &str) -> Result<Collection<'_>> {
        Ok(Collection {
            client: self,
            def: self.db.collection(name)?,
        })
    }

    /// Build the sync coordinator for this tab.
    pub fn coordinator<R: RemoteStore, C: Connectivity>(
        &self,
        remote: Arc<R>,
        connectivity: C,
        config: SyncConfig,
    ) -> SyncCoordinator<R, C> {
        SyncCoordinator::new(
            self.db.clone(),
            self.bus.clone(),
            remote,
            connectivity,
            self.clock.clone(),
            self.tab_id.clone(),
            config,
        )
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.bus.events()
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.db.pending_count().await
    }

    pub async fn dead_letters(&self) -> Result<Vec<Operation>> {
        self.db.dead_letters().await
    }

    pub async fn conflicts(&self) -> Result<Vec<Operation>> {
        self.db.conflicts().await
    }

    /// Put a dead-lettered operation back in the queue with a fresh attempt
    /// budget.
    pub async fn retry_dead_letter(&self, seq: Seq) -> Result<()> {
        let op = self.expect_status(seq, &[OpStatus::DeadLettered]).await?;
        let mut conn = self.db.pool().acquire().await?;
        if !db::operations::reopen(&mut conn, seq, OpStatus::DeadLettered).await? {
            return Err(Error::InvalidState(format!("operation {seq} changed concurrently")));
        }
        tracing::info!(
            seq,
            collection = %op.collection,
            id = %op.record_id,
            "Dead letter requeued"
        );
        self.bus.local_write();
        Ok(())
    }

    /// Give up on a dead-lettered or conflicted operation. When nothing else
    /// is queued for the record it rolls back to its last remote state.
    pub async fn discard(&self, seq: Seq) -> Result<()> {
        let op = self
            .expect_status(seq, &[OpStatus::DeadLettered, OpStatus::Conflicted])
            .await?;
        self.drop_operation(&op, "discarded by operator").await?;
        tracing::info!(
            seq,
            collection = %op.collection,
            id = %op.record_id,
            "Operation discarded"
        );
        Ok(())
    }

    /// Settle a conflict parked by a manual-policy collection.
    pub async fn resolve_conflict(&self, seq: Seq, choice: Choice) -> Result<()> {
        let op = self.expect_status(seq, &[OpStatus::Conflicted]).await?;
        match choice {
            Choice::KeepLocal => {
                let mut conn = self.db.pool().acquire().await?;
                if !db::operations::reopen(&mut conn, seq, OpStatus::Conflicted).await? {
                    return Err(Error::InvalidState(format!(
                        "operation {seq} changed concurrently"
                    )));
                }
                self.bus.local_write();
            }
            Choice::KeepRemote => {
                self.drop_operation(&op, "conflict resolved: keep remote")
                    .await?
            }
        }
        tracing::info!(seq, ?choice, "Conflict resolved by operator");
        Ok(())
    }

    async fn expect_status(&self, seq: Seq, allowed: &[OpStatus]) -> Result<Operation> {
        let op = self.db.operation(seq).await?;
        if allowed.contains(&op.status) {
            Ok(op)
        } else {
            Err(Error::InvalidState(format!("operation {seq} is {}", op.status)))
        }
    }

    async fn drop_operation(&self, op: &Operation, reason: &str) -> Result<()> {
        let def = self.db.collection(&op.collection)?;

        let mut tx = self.db.begin().await?;
        if !db::operations::discard(&mut tx, op.seq, reason).await? {
            return Err(Error::InvalidState(format!(
                "operation {} changed concurrently",
                op.seq
            )));
        }
        // A parked op carries the revision it lost against.
        if let Some(revision) = &op.base_revision {
            db::operations::rebase_open(&mut tx, &op.collection, &op.record_id, op.seq, revision)
                .await?;
        }
        if !db::operations::has_open(&mut tx, &op.collection, &op.record_id).await? {
            rollback_record(&mut tx, def, &op.record_id).await?;
        }
        tx.commit().await?;

        self.bus.notify(&op.collection);
        Ok(())
    }

    /// Wake subscribers and the coordinator after a local write.
    fn wrote(&self, collection: &str) {
        self.bus.notify(collection);
        self.bus.local_write();
    }
}

/// Reads and optimistic writes against one collection.
#[derive(Debug, Clone, Copy)]
pub struct Collection<'a> {
    client: &'a SyncClient,
    def: &'a CollectionDef,
}

impl Collection<'_> {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Insert a new record under a fresh id and queue its creation.
    pub async fn create(&self, payload: serde_json::Value) -> Result<RecordId> {
        self.def.validate_payload(&payload)?;
        let id = Uuid::new_v4().to_string();
        let now = self.client.clock.now();

        let record = Record::new_local(&self.def.name, &id, payload.clone(), now);
        let op = NewOperation::create(
            Uuid::new_v4().to_string(),
            &self.def.name,
            &id,
            payload,
            record.local_revision,
            now,
        );

        let mut tx = self.client.db.begin().await?;
        db::records::put_record(&mut tx, self.def, &record).await?;
        let seq = db::operations::append(&mut tx, &op).await?;
        tx.commit().await?;

        tracing::debug!(seq, collection = %self.def.name, id = %id, "Queued create");
        self.client.wrote(&self.def.name);
        Ok(id)
    }

    /// Shallow-merge `patch` into a record; `null` removes a field.
    pub async fn update(&self, id: &str, patch: serde_json::Value) -> Result<()> {
        self.def.validate_patch(&patch)?;
        let now = self.client.clock.now();

        let mut tx = self.client.db.begin().await?;
        let mut record = self.live_record(&mut tx, id).await?;
        record.apply_patch(&patch, now)?;
        let op = NewOperation::update(
            Uuid::new_v4().to_string(),
            &self.def.name,
            id,
            patch,
            record.remote_revision.clone(),
            record.local_revision,
            now,
        );
        db::records::put_record(&mut tx, self.def, &record).await?;
        let seq = db::operations::append(&mut tx, &op).await?;
        tx.commit().await?;

        tracing::debug!(seq, collection = %self.def.name, id, "Queued update");
        self.client.wrote(&self.def.name);
        Ok(())
    }

    /// Tombstone a record and queue its deletion.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let now = self.client.clock.now();

        let mut tx = self.client.db.begin().await?;
        let mut record = self.live_record(&mut tx, id).await?;
        record.mark_deleted(now)?;
        let op = NewOperation::delete(
            Uuid::new_v4().to_string(),
            &self.def.name,
            id,
            record.remote_revision.clone(),
            record.local_revision,
            now,
        );
        db::records::put_record(&mut tx, self.def, &record).await?;
        let seq = db::operations::append(&mut tx, &op).await?;
        tx.commit().await?;

        tracing::debug!(seq, collection = %self.def.name, id, "Queued delete");
        self.client.wrote(&self.def.name);
        Ok(())
    }

    /// A live record, or `None` if it does not exist or is deleted.
    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        Ok(self
            .client
            .db
            .get(&self.def.name, id)
            .await?
            .filter(Record::is_active))
    }

    pub async fn list(&self) -> Result<Vec<Record>> {
        self.client.db.get_all(&self.def.name).await
    }

    pub async fn query_by_index(
        &self,
        index: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<Record>> {
        self.client
            .db
            .query_by_index(&self.def.name, index, value)
            .await
    }

    /// Follow the collection's live records.
    pub fn subscribe(&self) -> Subscription {
        let (sender, changes) = mpsc::unbounded_channel();
        let sub_id = self.client.bus.register(&self.def.name, sender);
        Subscription {
            db: self.client.db.clone(),
            bus: self.client.bus.clone(),
            collection: self.def.name.clone(),
            sub_id,
            changes,
            primed: false,
            seen: 0,
            poll_interval: self.client.poll_interval,
            ticker: None,
        }
    }

    /// Call `callback` with the current records and again after every change.
    pub fn watch<F>(&self, mut callback: F) -> Unsubscribe
    where
        F: FnMut(Vec<Record>) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(view) = subscription.next().await {
                match view {
                    Ok(records) => callback(records),
                    Err(e) => tracing::warn!(
                        collection = %subscription.collection,
                        error = %e,
                        "Failed to load subscription view"
                    ),
                }
            }
        });
        Unsubscribe { task }
    }

    async fn live_record(&self, conn: &mut sqlx::SqliteConnection, id: &str) -> Result<Record> {
        db::records::get_record(conn, self.def, id)
            .await?
            .filter(Record::is_active)
            .ok_or_else(|| Error::NotFound {
                collection: self.def.name.clone(),
                id: id.to_string(),
            })
    }
}

/// A live view of one collection. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    db: Db,
    bus: Arc<ChangeBus>,
    collection: CollectionName,
    sub_id: String,
    changes: mpsc::UnboundedReceiver<CollectionName>,
    primed: bool,
    /// Change counter as of the last view handed out
    seen: i64,
    poll_interval: Duration,
    ticker: Option<Interval>,
}

impl Subscription {
    /// The current records on the first call, then the records after each
    /// subsequent change. Bursts of changes collapse into one view.
    ///
    /// Changes arrive from the bus, or from the collection's change counter
    /// when another tab on a different bus wrote to the shared file.
    pub async fn next(&mut self) -> Option<Result<Vec<Record>>> {
        if self.primed {
            if let Err(e) = self.changed().await? {
                return Some(Err(e));
            }
        }
        self.primed = true;
        Some(self.load().await)
    }

    async fn load(&mut self) -> Result<Vec<Record>> {
        self.seen = self.db.change_version(&self.collection).await?;
        self.db.get_all(&self.collection).await
    }

    /// Resolves once the view may differ from the last one, or `None` when
    /// the bus has dropped this subscription.
    async fn changed(&mut self) -> Option<Result<()>> {
        let poll_interval = self.poll_interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            tokio::select! {
                change = self.changes.recv() => {
                    change?;
                    while self.changes.try_recv().is_ok() {}
                    return Some(Ok(()));
                }
                _ = ticker.tick() => {
                    match self.db.change_version(&self.collection).await {
                        Ok(version) if version == self.seen => {}
                        Ok(_) => return Some(Ok(())),
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unregister(&self.sub_id);
    }
}

/// Stops a [`Collection::watch`] callback when called or dropped.
#[derive(Debug)]
pub struct Unsubscribe {
    task: JoinHandle<()>,
}

impl Unsubscribe {
    /// Stop the callback. Same as dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_engine::{ManualClock, OpKind};

    async fn client() -> SyncClient {
        let db = Db::open_in_memory(Schema::dashboard()).await.unwrap();
        SyncClient::new(
            db,
            ChangeBus::new_shared(),
            Arc::new(ManualClock::new(1_000)),
            "tab-a",
        )
    }

    #[tokio::test]
    async fn create_queues_operation_in_same_write() {
        let client = client().await;
        let tasks = client.collection("tasks").unwrap();

        let id = tasks.create(json!({"title": "Read ch. 3"})).await.unwrap();

        let record = tasks.get(&id).await.unwrap().unwrap();
        assert_eq!(record.payload["title"], "Read ch. 3");
        assert!(record.has_unsynced());

        let op = client.db().operation(1).await.unwrap();
        assert_eq!(op.kind, OpKind::Create);
        assert_eq!(op.record_id, id);
        assert_eq!(client.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn update_and_delete_queue_in_order() {
        let client = client().await;
        let tasks = client.collection("tasks").unwrap();
        let id = tasks.create(json!({"title": "A", "priority": "low"})).await.unwrap();

        tasks.update(&id, json!({"priority": "high", "title": null})).await.unwrap();
        let record = tasks.get(&id).await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"priority": "high"}));
        assert_eq!(record.local_revision, 2);

        tasks.delete(&id).await.unwrap();
        assert!(tasks.get(&id).await.unwrap().is_none());
        assert!(tasks.list().await.unwrap().is_empty());

        let update = client.db().operation(2).await.unwrap();
        assert_eq!(update.kind, OpKind::Update);
        assert_eq!(update.payload, json!({"priority": "high", "title": null}));
        assert_eq!(client.db().operation(3).await.unwrap().kind, OpKind::Delete);
        assert_eq!(client.pending_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn writes_to_missing_records_fail() {
        let client = client().await;
        let tasks = client.collection("tasks").unwrap();

        let err = tasks.update("nope", json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(matches!(
            tasks.delete("nope").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            tasks.create(json!("not an object")).await,
            Err(Error::Engine(_))
        ));
        assert!(client.collection("grades").is_err());
    }

    #[tokio::test]
    async fn subscription_sees_current_view_then_changes() {
        let client = client().await;
        let tasks = client.collection("tasks").unwrap();
        tasks.create(json!({"title": "First"})).await.unwrap();

        let mut sub = tasks.subscribe();
        assert_eq!(sub.next().await.unwrap().unwrap().len(), 1);

        tasks.create(json!({"title": "Second"})).await.unwrap();
        tasks.create(json!({"title": "Third"})).await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().len(), 3);

        drop(sub);
        assert_eq!(client.bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn operator_actions_check_status() {
        let client = client().await;
        let tasks = client.collection("tasks").unwrap();
        tasks.create(json!({"title": "A"})).await.unwrap();

        assert!(matches!(
            client.retry_dead_letter(1).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            client.resolve_conflict(1, Choice::KeepLocal).await,
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            client.discard(42).await,
            Err(Error::OperationNotFound(42))
        ));
    }

    #[tokio::test]
    async fn discarding_dead_create_removes_record() {
        let client = client().await;
        let tasks = client.collection("tasks").unwrap();
        let id = tasks.create(json!({"title": "A"})).await.unwrap();
        client.db().dead_letter(1, "gave up").await.unwrap();

        client.discard(1).await.unwrap();

        assert!(tasks.get(&id).await.unwrap().is_none());
        assert_eq!(
            client.db().operation(1).await.unwrap().status,
            OpStatus::Discarded
        );
        assert!(client.dead_letters().await.unwrap().is_empty());
    }
}
