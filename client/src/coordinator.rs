//! The sync coordinator.
//!
//! Runs in whichever tab holds the sync lease and moves between five states:
//!
//! ```text
//!          online + leader            batch empty
//!   Idle ------------------> Draining -------------> Listening
//!    ^                        |  ^                     |   |
//!    | offline                |  | local write         |   | feed expired /
//!    |                        v  |                     |   v meta stale
//!   Suspended <----------- (connectivity lost) ---- Reconciling
//! ```
//!
//! Draining dispatches queued operations with bounded fan-out. Every result
//! is written back under the epoch the operation was claimed with, so a reply
//! arriving after leadership moved on is dropped instead of clobbering the new
//! leader's bookkeeping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, FutureExt};
use futures::stream::{self, BoxStream, SelectAll, StreamExt};
use tether_engine::{
    plan_resnapshot, resolve_conflict, Clock, CollectionDef, ConflictOutcome,
    ConflictResolution, Epoch, FailureOutcome, Mutation, OpKind, OpStatus, Operation, Record,
    RemoteDoc, SyncMeta, TabId, Timestamp,
};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::bus::ChangeBus;
use crate::config::SyncConfig;
use crate::connectivity::Connectivity;
use crate::db::{self, Db};
use crate::error::Result;
use crate::events::{SyncEvent, SyncState};
use crate::leader::LeaderCoordinator;
use crate::remote::{Commit, RemoteError, RemoteStore};

/// Upper bound on steps taken by [`SyncCoordinator::sync_now`].
const MAX_SETTLE_STEPS: usize = 64;

enum FeedItem {
    Change(RemoteDoc),
    Closed(String),
}

type Feeds = SelectAll<BoxStream<'static, FeedItem>>;

enum FeedOpen {
    Ready(Option<Feeds>),
    Expired,
    Unavailable,
}

/// Drives local operations out to the remote store and remote changes in.
pub struct SyncCoordinator<R, C> {
    worker: Worker<R, C>,
    leader: LeaderCoordinator,
    state: SyncState,
    feeds: Option<Feeds>,
    last_touch: Option<Timestamp>,
}

/// Everything a step needs besides the coordinator's own mutable state.
struct Worker<R, C> {
    db: Db,
    remote: Arc<R>,
    connectivity: C,
    bus: Arc<ChangeBus>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    tab_id: TabId,
}

impl<R: RemoteStore, C: Connectivity> SyncCoordinator<R, C> {
    pub fn new(
        db: Db,
        bus: Arc<ChangeBus>,
        remote: Arc<R>,
        connectivity: C,
        clock: Arc<dyn Clock>,
        tab_id: impl Into<TabId>,
        config: SyncConfig,
    ) -> Self {
        let tab_id = tab_id.into();
        let leader = LeaderCoordinator::new(
            db.clone(),
            tab_id.clone(),
            config.lease_ttl_ms,
            clock.clone(),
        );
        Self {
            worker: Worker {
                db,
                remote,
                connectivity,
                bus,
                clock,
                config,
                tab_id,
            },
            leader,
            state: SyncState::Idle,
            feeds: None,
            last_touch: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn leader(&self) -> &LeaderCoordinator {
        &self.leader
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    /// Take one step of the state machine and return the new state.
    pub async fn step(&mut self) -> Result<SyncState> {
        let next = if !self.worker.connectivity.is_online() {
            self.feeds = None;
            if self.state.is_active() || self.state == SyncState::Suspended {
                SyncState::Suspended
            } else {
                SyncState::Idle
            }
        } else {
            self.maintain_lease().await?;
            if !self.leader.is_leader() {
                self.feeds = None;
                SyncState::Idle
            } else {
                match self.state {
                    SyncState::Idle | SyncState::Suspended => SyncState::Draining,
                    SyncState::Draining => self.drain().await?,
                    SyncState::Listening => self.listen().await?,
                    SyncState::Reconciling => self.reconcile().await?,
                }
            }
        };

        self.transition(next);
        Ok(next)
    }

    /// Step until there is nothing left to do right now.
    pub async fn sync_now(&mut self) -> Result<SyncState> {
        let mut previous = self.state;
        for _ in 0..MAX_SETTLE_STEPS {
            let state = self.step().await?;
            let resting = matches!(
                state,
                SyncState::Idle | SyncState::Suspended | SyncState::Listening
            );
            if resting && state == previous {
                return Ok(state);
            }
            previous = state;
        }
        Ok(self.state)
    }

    /// Run until `shutdown` flips to true or its sender is dropped, then
    /// release the lease.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut online = self.worker.connectivity.subscribe();
        let mut local_writes = self.worker.bus.watch_local_writes();
        let mut ticker = tokio::time::interval(self.worker.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(tab = %self.worker.tab_id, "Sync coordinator started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.step().await {
                Ok(SyncState::Draining | SyncState::Reconciling) => continue,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(tab = %self.worker.tab_id, error = %e, "Sync step failed")
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Ok(()) = online.changed() => {}
                Ok(()) = local_writes.changed() => {}
                _ = ticker.tick() => {}
                item = next_feed_item(&mut self.feeds) => match item {
                    Some(FeedItem::Change(doc)) => {
                        if let Err(e) = self.worker.merge_change(doc).await {
                            // The cursor did not move, so reopening replays the change.
                            tracing::error!(error = %e, "Failed to merge remote change");
                            self.feeds = None;
                        }
                    }
                    Some(FeedItem::Closed(collection)) => {
                        tracing::debug!(collection = %collection, "Change feed closed, reopening");
                        self.feeds = None;
                    }
                    None => self.feeds = None,
                },
            }
        }

        self.feeds = None;
        self.leader.resign().await?;
        self.transition(SyncState::Idle);
        tracing::info!(tab = %self.worker.tab_id, "Sync coordinator stopped");
        Ok(())
    }

    async fn maintain_lease(&mut self) -> Result<()> {
        let now = self.worker.now();
        let due = match self.leader.last_tick() {
            None => true,
            Some(at) => {
                !self.leader.is_leader()
                    || now.saturating_sub(at) >= self.worker.config.renew_interval_ms
            }
        };
        if due && self.leader.tick().await? {
            if !self.leader.is_leader() {
                self.feeds = None;
            }
            self.worker.bus.emit(SyncEvent::LeadershipChanged {
                tab_id: self.worker.tab_id.clone(),
                role: self.leader.role().clone(),
            });
        }
        Ok(())
    }

    fn transition(&mut self, next: SyncState) {
        if next == self.state {
            return;
        }
        tracing::info!(
            tab = %self.worker.tab_id,
            from = %self.state,
            to = %next,
            "Sync state changed"
        );
        self.worker.bus.emit(SyncEvent::StateChanged {
            tab_id: self.worker.tab_id.clone(),
            from: self.state,
            to: next,
        });
        self.state = next;
    }

    async fn drain(&mut self) -> Result<SyncState> {
        let Some(epoch) = self.leader.epoch() else {
            return Ok(SyncState::Idle);
        };
        let worker = &self.worker;

        let batch = worker
            .db
            .next_batch(None, worker.config.batch_size, worker.now())
            .await?;
        if batch.is_empty() {
            return Ok(if worker.needs_reconcile().await? {
                SyncState::Reconciling
            } else {
                SyncState::Listening
            });
        }

        let mut claimed = Vec::with_capacity(batch.len());
        for op in batch {
            if worker.db.claim(op.seq, epoch).await? {
                claimed.push(op);
            }
        }

        let lease_left = Duration::from_millis(self.leader.lease_remaining());
        worker.dispatch_batch(claimed, epoch, lease_left).await?;

        Ok(if !worker.connectivity.is_online() {
            SyncState::Suspended
        } else if !self.leader.is_leader() {
            SyncState::Idle
        } else {
            SyncState::Draining
        })
    }

    async fn listen(&mut self) -> Result<SyncState> {
        let now = self.worker.now();
        if !self.worker.db.next_batch(None, 1, now).await?.is_empty() {
            return Ok(SyncState::Draining);
        }
        if self.worker.needs_reconcile().await? {
            self.feeds = None;
            return Ok(SyncState::Reconciling);
        }

        if self.feeds.is_none() {
            match self.worker.open_feeds().await? {
                FeedOpen::Ready(feeds) => self.feeds = feeds,
                FeedOpen::Expired => return Ok(SyncState::Reconciling),
                FeedOpen::Unavailable => return Ok(SyncState::Listening),
            }
        }

        loop {
            let Some(feeds) = self.feeds.as_mut() else {
                break;
            };
            match feeds.next().now_or_never() {
                Some(Some(FeedItem::Change(doc))) => {
                    if let Err(e) = self.worker.merge_change(doc).await {
                        self.feeds = None;
                        return Err(e);
                    }
                }
                Some(Some(FeedItem::Closed(_))) | Some(None) => {
                    self.feeds = None;
                    break;
                }
                None => break,
            }
        }

        let renew_every = self.worker.config.renew_interval_ms;
        let touch_due = self
            .last_touch
            .map_or(true, |at| now.saturating_sub(at) >= renew_every);
        if touch_due && self.feeds.is_some() {
            self.worker.touch_all(now).await?;
            self.last_touch = Some(now);
        }

        Ok(SyncState::Listening)
    }

    async fn reconcile(&mut self) -> Result<SyncState> {
        let now = self.worker.now();
        let stale: Vec<CollectionDef> = self
            .worker
            .stale_collections(now)
            .await?
            .into_iter()
            .cloned()
            .collect();

        for def in &stale {
            let listing = self.worker.remote.list_docs(&def.name);
            let docs = match self.worker.call(listing).await {
                Ok(docs) => docs,
                Err(e) => {
                    tracing::warn!(collection = %def.name, error = %e, "Resnapshot listing failed");
                    return Ok(if self.worker.connectivity.is_online() {
                        SyncState::Listening
                    } else {
                        SyncState::Suspended
                    });
                }
            };
            self.worker.apply_resnapshot(def, docs, now).await?;
        }

        self.feeds = None;
        Ok(SyncState::Listening)
    }
}

impl<R: RemoteStore, C: Connectivity> Worker<R, C> {
    fn now(&self) -> Timestamp {
        self.clock.now()
    }

    async fn call<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> std::result::Result<T, RemoteError> {
        match tokio::time::timeout(self.config.call_timeout(), call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient("remote call timed out".into())),
        }
    }

    async fn dispatch(
        &self,
        op: Operation,
    ) -> (Operation, std::result::Result<RemoteDoc, RemoteError>) {
        let commit = Commit {
            collection: op.collection.clone(),
            id: op.record_id.clone(),
            op_id: op.op_id.clone(),
            mutation: op.mutation(),
            expected_revision: op.base_revision.clone(),
            issued_at: op.created_at,
        };
        tracing::debug!(
            seq = op.seq,
            collection = %op.collection,
            id = %op.record_id,
            kind = %op.kind,
            "Dispatching operation"
        );
        let result = self.call(self.remote.commit_doc(commit)).await;
        (op, result)
    }

    /// Dispatch `ops` with bounded fan-out, abandoning whatever is still in
    /// flight if connectivity drops or the lease runs out.
    async fn dispatch_batch(
        &self,
        ops: Vec<Operation>,
        epoch: Epoch,
        lease_left: Duration,
    ) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        tracing::debug!(ops = ops.len(), epoch, "Draining batch");

        let dispatches = stream::iter(ops)
            .map(|op| self.dispatch(op))
            .buffer_unordered(self.config.fan_out);
        let (mut dispatches, abort) = stream::abortable(dispatches);

        let mut online = self.connectivity.subscribe();
        let lease_lapse = tokio::time::sleep(lease_left);
        tokio::pin!(lease_lapse);
        let mut aborted = false;

        loop {
            tokio::select! {
                next = dispatches.next() => match next {
                    Some((op, result)) => self.complete(op, result, epoch).await?,
                    None => break,
                },
                changed = online.changed(), if !aborted => {
                    if changed.is_err() || !*online.borrow_and_update() {
                        tracing::warn!(
                            epoch,
                            "Connectivity lost mid-drain, abandoning in-flight calls"
                        );
                        abort.abort();
                        aborted = true;
                    }
                }
                _ = &mut lease_lapse, if !aborted => {
                    tracing::warn!(epoch, "Lease lapsed mid-drain, abandoning in-flight calls");
                    abort.abort();
                    aborted = true;
                }
            }
        }
        Ok(())
    }

    async fn complete(
        &self,
        op: Operation,
        result: std::result::Result<RemoteDoc, RemoteError>,
        epoch: Epoch,
    ) -> Result<()> {
        match result {
            Ok(doc) => self.acknowledge(&op, &doc, epoch).await,
            Err(RemoteError::Conflict { current }) => self.on_conflict(&op, *current, epoch).await,
            Err(RemoteError::Rejected(reason)) => self.reject(&op, &reason, epoch).await,
            Err(e) => self.fail(&op, &e.to_string(), epoch).await,
        }
    }

    async fn acknowledge(&self, op: &Operation, doc: &RemoteDoc, epoch: Epoch) -> Result<()> {
        let def = self.db.collection(&op.collection)?;
        let mut tx = self.db.begin().await?;

        if !db::operations::finish(&mut tx, op.seq, OpStatus::Synced, None, Some(epoch)).await? {
            tracing::warn!(seq = op.seq, epoch, "Dropping stale acknowledgement");
            return Ok(());
        }

        let mut reassigned = None;
        if doc.id != op.record_id {
            db::records::rename_record(&mut tx, def, &op.record_id, &doc.id).await?;
            db::operations::rekey(&mut tx, &op.collection, &op.record_id, &doc.id).await?;
            reassigned = Some(SyncEvent::IdReassigned {
                collection: op.collection.clone(),
                local_id: op.record_id.clone(),
                remote_id: doc.id.clone(),
            });
        }

        db::operations::rebase_open(&mut tx, &op.collection, &doc.id, op.seq, &doc.revision).await?;
        let still_open = db::operations::has_open(&mut tx, &op.collection, &doc.id).await?;

        match db::records::get_record(&mut tx, def, &doc.id).await? {
            Some(_) if op.kind == OpKind::Delete && !still_open => {
                db::records::delete_record(&mut tx, def, &doc.id).await?;
            }
            Some(mut record) => {
                record.acknowledge(doc, op.revision);
                db::records::put_record(&mut tx, def, &record).await?;
            }
            None if !doc.deleted && !still_open => {
                db::records::put_record(&mut tx, def, &Record::from_remote(doc)).await?;
            }
            None => {}
        }
        tx.commit().await?;

        tracing::debug!(
            seq = op.seq,
            collection = %op.collection,
            id = %doc.id,
            revision = %doc.revision,
            "Operation synced"
        );
        self.bus.notify(&op.collection);
        if let Some(event) = reassigned {
            tracing::info!(
                collection = %op.collection,
                from = %op.record_id,
                to = %doc.id,
                "Record id reassigned"
            );
            self.bus.emit(event);
        }
        Ok(())
    }

    async fn on_conflict(&self, op: &Operation, current: RemoteDoc, epoch: Epoch) -> Result<()> {
        let def = self.db.collection(&op.collection)?;
        let shadow = self
            .db
            .get(&op.collection, &op.record_id)
            .await?
            .and_then(|record| record.remote_payload);

        match resolve_conflict(def.policy, op, shadow.as_ref(), &current) {
            ConflictOutcome::AlreadyApplied => {
                tracing::debug!(seq = op.seq, "Remote already holds this write");
                self.acknowledge(op, &current, epoch).await
            }
            ConflictOutcome::Recommit {
                mutation,
                resolution,
            } => {
                self.recommit(op, mutation, resolution, &current, epoch)
                    .await
            }
            ConflictOutcome::AcceptRemote => self.accept_remote(op, &current, epoch).await,
            ConflictOutcome::Manual => self.park(op, &current, epoch).await,
        }
    }

    /// Rewrite the operation against the remote's current revision. It is
    /// due immediately and goes out with the next batch.
    async fn recommit(
        &self,
        op: &Operation,
        mutation: Mutation,
        resolution: ConflictResolution,
        current: &RemoteDoc,
        epoch: Epoch,
    ) -> Result<()> {
        let def = self.db.collection(&op.collection)?;
        let (kind, payload) = match mutation {
            Mutation::Set(payload) => (OpKind::Create, payload),
            Mutation::Patch(patch) => (OpKind::Update, patch),
            Mutation::Delete => (OpKind::Delete, serde_json::Value::Null),
        };

        let mut tx = self.db.begin().await?;
        let rewritten =
            db::operations::rewrite(&mut tx, op, kind, &payload, &current.revision, Some(epoch))
                .await?;
        if !rewritten {
            tracing::warn!(seq = op.seq, epoch, "Dropping stale conflict");
            return Ok(());
        }
        db::operations::rebase_open(
            &mut tx,
            &op.collection,
            &op.record_id,
            op.seq,
            &current.revision,
        )
        .await?;
        if let Some(mut record) = db::records::get_record(&mut tx, def, &op.record_id).await? {
            record.remote_revision = Some(current.revision.clone());
            if !current.deleted {
                record.remote_payload = Some(current.payload.clone());
            }
            db::records::put_record(&mut tx, def, &record).await?;
        }
        tx.commit().await?;

        tracing::info!(
            seq = op.seq,
            collection = %op.collection,
            id = %op.record_id,
            ?resolution,
            "Conflict resolved, recommitting"
        );
        self.bus.emit(SyncEvent::ConflictResolved {
            seq: op.seq,
            collection: op.collection.clone(),
            record_id: op.record_id.clone(),
            resolution,
        });
        Ok(())
    }

    async fn accept_remote(&self, op: &Operation, current: &RemoteDoc, epoch: Epoch) -> Result<()> {
        let def = self.db.collection(&op.collection)?;
        let reason = format!("superseded by remote revision {}", current.revision);

        let mut tx = self.db.begin().await?;
        let finished = db::operations::finish(
            &mut tx,
            op.seq,
            OpStatus::Discarded,
            Some(&reason),
            Some(epoch),
        )
        .await?;
        if !finished {
            tracing::warn!(seq = op.seq, epoch, "Dropping stale conflict");
            return Ok(());
        }
        db::operations::rebase_open(
            &mut tx,
            &op.collection,
            &op.record_id,
            op.seq,
            &current.revision,
        )
        .await?;
        let still_open = db::operations::has_open(&mut tx, &op.collection, &op.record_id).await?;

        match db::records::get_record(&mut tx, def, &op.record_id).await? {
            Some(_) if current.deleted && !still_open => {
                db::records::delete_record(&mut tx, def, &op.record_id).await?;
            }
            Some(mut record) => {
                record.acknowledge(current, op.revision);
                db::records::put_record(&mut tx, def, &record).await?;
            }
            None if !current.deleted && !still_open => {
                db::records::put_record(&mut tx, def, &Record::from_remote(current)).await?;
            }
            None => {}
        }
        tx.commit().await?;

        tracing::info!(
            seq = op.seq,
            collection = %op.collection,
            id = %op.record_id,
            "Conflict resolved, remote wins"
        );
        self.bus.notify(&op.collection);
        self.bus.emit(SyncEvent::ConflictResolved {
            seq: op.seq,
            collection: op.collection.clone(),
            record_id: op.record_id.clone(),
            resolution: ConflictResolution::RemoteWins,
        });
        Ok(())
    }

    async fn park(&self, op: &Operation, current: &RemoteDoc, epoch: Epoch) -> Result<()> {
        let def = self.db.collection(&op.collection)?;

        let mut tx = self.db.begin().await?;
        if !db::operations::park_conflict(&mut tx, op.seq, &current.revision, Some(epoch)).await? {
            tracing::warn!(seq = op.seq, epoch, "Dropping stale conflict");
            return Ok(());
        }
        if let Some(mut record) = db::records::get_record(&mut tx, def, &op.record_id).await? {
            record.remote_revision = Some(current.revision.clone());
            if !current.deleted {
                record.remote_payload = Some(current.payload.clone());
            }
            db::records::put_record(&mut tx, def, &record).await?;
        }
        tx.commit().await?;

        tracing::warn!(
            seq = op.seq,
            collection = %op.collection,
            id = %op.record_id,
            remote_revision = %current.revision,
            "Conflict needs manual resolution"
        );
        self.bus.emit(SyncEvent::ConflictDetected {
            seq: op.seq,
            collection: op.collection.clone(),
            record_id: op.record_id.clone(),
            remote_revision: current.revision.clone(),
        });
        Ok(())
    }

    async fn reject(&self, op: &Operation, reason: &str, epoch: Epoch) -> Result<()> {
        let def = self.db.collection(&op.collection)?;

        let mut tx = self.db.begin().await?;
        let finished = db::operations::finish(
            &mut tx,
            op.seq,
            OpStatus::Discarded,
            Some(reason),
            Some(epoch),
        )
        .await?;
        if !finished {
            tracing::warn!(seq = op.seq, epoch, "Dropping stale rejection");
            return Ok(());
        }
        if !db::operations::has_open(&mut tx, &op.collection, &op.record_id).await? {
            rollback_record(&mut tx, def, &op.record_id).await?;
        }
        tx.commit().await?;

        tracing::warn!(
            seq = op.seq,
            collection = %op.collection,
            id = %op.record_id,
            reason,
            "Operation rejected by remote"
        );
        self.bus.notify(&op.collection);
        self.bus.emit(SyncEvent::Rejected {
            seq: op.seq,
            collection: op.collection.clone(),
            record_id: op.record_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn fail(&self, op: &Operation, error: &str, epoch: Epoch) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        let outcome = db::operations::record_failure(
            &mut conn,
            op.seq,
            error,
            &self.config.retry,
            self.now(),
            Some(epoch),
        )
        .await?;

        match outcome {
            None => tracing::warn!(seq = op.seq, epoch, "Dropping stale failure"),
            Some(FailureOutcome::Retry {
                attempts,
                next_attempt_at,
            }) => tracing::warn!(
                seq = op.seq,
                attempts,
                next_attempt_at,
                error,
                "Dispatch failed, will retry"
            ),
            Some(FailureOutcome::DeadLetter { attempts }) => {
                tracing::error!(
                    seq = op.seq,
                    collection = %op.collection,
                    id = %op.record_id,
                    attempts,
                    error,
                    "Operation dead-lettered"
                );
                self.bus.emit(SyncEvent::DeadLettered {
                    seq: op.seq,
                    collection: op.collection.clone(),
                    record_id: op.record_id.clone(),
                    error: error.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Merge one change from a remote feed.
    ///
    /// Records with open operations keep their local state; the change
    /// reaches them through the acknowledgement or a later resnapshot.
    async fn merge_change(&self, doc: RemoteDoc) -> Result<()> {
        let Ok(def) = self.db.collection(&doc.collection) else {
            tracing::warn!(collection = %doc.collection, "Change for unknown collection");
            return Ok(());
        };
        let now = self.now();

        let mut tx = self.db.begin().await?;
        let mut meta = db::meta::get_meta(&mut tx, &doc.collection).await?;
        meta.observe_change(doc.updated_at, now);
        db::meta::put_meta(&mut tx, &meta).await?;

        let changed = if db::operations::has_open(&mut tx, &doc.collection, &doc.id).await? {
            tracing::debug!(
                collection = %doc.collection,
                id = %doc.id,
                "Local intent pending, deferring remote change"
            );
            false
        } else {
            match db::records::get_record(&mut tx, def, &doc.id).await? {
                Some(_) if doc.deleted => db::records::delete_record(&mut tx, def, &doc.id).await?,
                Some(mut record) => {
                    record.apply_remote(&doc)
                        && db::records::put_record(&mut tx, def, &record).await?
                }
                None if doc.deleted => false,
                None => db::records::put_record(&mut tx, def, &Record::from_remote(&doc)).await?,
            }
        };
        tx.commit().await?;

        if changed {
            tracing::trace!(
                collection = %doc.collection,
                id = %doc.id,
                revision = %doc.revision,
                "Remote change merged"
            );
            self.bus.notify(&doc.collection);
        }
        Ok(())
    }

    async fn stale_collections(&self, now: Timestamp) -> Result<Vec<&CollectionDef>> {
        let metas: HashMap<String, SyncMeta> = self
            .db
            .all_meta()
            .await?
            .into_iter()
            .map(|m| (m.collection.clone(), m))
            .collect();
        let retention = self.config.retention_window_ms;

        Ok(self
            .db
            .schema()
            .collections
            .values()
            .filter(|def| {
                metas
                    .get(&def.name)
                    .map_or(true, |meta| meta.needs_resnapshot(now, retention))
            })
            .collect())
    }

    async fn needs_reconcile(&self) -> Result<bool> {
        Ok(!self.stale_collections(self.now()).await?.is_empty())
    }

    async fn apply_resnapshot(
        &self,
        def: &CollectionDef,
        docs: Vec<RemoteDoc>,
        now: Timestamp,
    ) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let local = db::records::list_records(&mut tx, def, true).await?;
        let pending = db::operations::open_record_ids(&mut tx, &def.name).await?;
        let plan = plan_resnapshot(&local, &pending, docs);

        let by_id: HashMap<&str, &Record> = local.iter().map(|r| (r.id.as_str(), r)).collect();
        for doc in &plan.upserts {
            let record = match by_id.get(doc.id.as_str()) {
                Some(existing) => {
                    let mut record = (*existing).clone();
                    record.apply_remote(doc);
                    record
                }
                None => Record::from_remote(doc),
            };
            db::records::put_record(&mut tx, def, &record).await?;
        }
        for id in &plan.purges {
            db::records::delete_record(&mut tx, def, id).await?;
        }

        // The listing is current as of now; later writes are stamped at or after it.
        let mut meta = db::meta::get_meta(&mut tx, &def.name).await?;
        meta.complete_resync(Some(plan.cursor.map_or(now, |c| c.max(now))), now);
        db::meta::put_meta(&mut tx, &meta).await?;
        tx.commit().await?;

        tracing::info!(
            collection = %def.name,
            upserts = plan.upserts.len(),
            purges = plan.purges.len(),
            deferred = plan.deferred.len(),
            "Resnapshot applied"
        );
        if !plan.is_noop() {
            self.bus.notify(&def.name);
        }
        Ok(())
    }

    async fn open_feeds(&self) -> Result<FeedOpen> {
        let mut feeds = SelectAll::new();
        let mut expired = false;
        for name in self.db.schema().names() {
            let cursor = self.db.meta(name).await?.cursor;
            match self.call(self.remote.listen_collection(name, cursor)).await {
                Ok(feed) => {
                    let closed = name.clone();
                    feeds.push(
                        feed.map(FeedItem::Change)
                            .chain(stream::once(future::ready(FeedItem::Closed(closed))))
                            .boxed(),
                    );
                }
                Err(RemoteError::CursorExpired) => {
                    tracing::warn!(collection = %name, ?cursor, "Change feed cursor expired");
                    let mut conn = self.db.pool().acquire().await?;
                    db::meta::invalidate(&mut conn, name).await?;
                    expired = true;
                }
                Err(e) => {
                    tracing::warn!(collection = %name, error = %e, "Could not open change feed");
                    return Ok(FeedOpen::Unavailable);
                }
            }
        }
        if expired {
            return Ok(FeedOpen::Expired);
        }
        Ok(FeedOpen::Ready((!feeds.is_empty()).then_some(feeds)))
    }

    /// Mark every listened collection as in sync as of `now`.
    async fn touch_all(&self, now: Timestamp) -> Result<()> {
        let mut tx = self.db.begin().await?;
        for meta in db::meta::list_meta(&mut tx).await? {
            if meta.cursor.is_some() && meta.last_synced_at.is_some() {
                let mut meta = meta;
                meta.touch(now);
                db::meta::put_meta(&mut tx, &meta).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Roll a record back to its last remote-confirmed state, removing it when
/// the remote never had it.
pub(crate) async fn rollback_record(
    conn: &mut sqlx::SqliteConnection,
    def: &CollectionDef,
    id: &str,
) -> Result<()> {
    if let Some(mut record) = db::records::get_record(conn, def, id).await? {
        if record.revert_to_remote() {
            db::records::put_record(conn, def, &record).await?;
        } else {
            db::records::delete_record(conn, def, id).await?;
        }
    }
    // Remote changes were deferred while the operation was open.
    db::meta::invalidate(conn, &def.name).await?;
    Ok(())
}

async fn next_feed_item(feeds: &mut Option<Feeds>) -> Option<FeedItem> {
    match feeds {
        Some(feeds) => feeds.next().await,
        None => future::pending().await,
    }
}
