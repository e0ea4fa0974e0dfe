//! In-process remote store.
//!
//! Behaves like a revisioned document database: every write gets a fresh
//! revision token, writes carry the revision they expect, replays of an
//! already-applied `op_id` return the stored result, and each collection has a
//! change feed that can only replay back to a retention horizon. Fault
//! injection hooks let tests take it offline, fail calls, reject documents or
//! slow calls down.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;

use super::{ChangeFeed, Commit, RemoteError, RemoteStore};
use tether_engine::{
    merge_patch, Clock, CollectionName, Mutation, OperationId, RecordId, RemoteDoc, Timestamp,
};

const FEED_CAPACITY: usize = 1024;

type DocKey = (CollectionName, RecordId);

/// A shared in-memory remote store. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    changes: broadcast::Sender<RemoteDoc>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Default)]
struct State {
    docs: BTreeMap<DocKey, RemoteDoc>,
    /// Server time each document was last written; feeds replay by this
    committed_at: HashMap<DocKey, Timestamp>,
    /// Where each applied op landed, for idempotent replays
    applied: HashMap<OperationId, DocKey>,
    /// Applied op ids in commit order
    log: Vec<OperationId>,
    revisions: u64,
    ids: u64,
    horizon: Timestamp,
    offline: bool,
    failures: u32,
    rejections: HashMap<DocKey, String>,
    assign_ids: bool,
    latency: Option<Duration>,
    commit_calls: u64,
}

impl State {
    fn check_reachable(&mut self) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::Offline);
        }
        if self.failures > 0 {
            self.failures -= 1;
            return Err(RemoteError::Transient("injected failure".into()));
        }
        Ok(())
    }

    fn next_revision(&mut self) -> String {
        self.revisions += 1;
        format!("r{}", self.revisions)
    }
}

fn require_object(payload: &serde_json::Value) -> Result<(), RemoteError> {
    if payload.is_object() {
        Ok(())
    } else {
        let reason = "document payload must be an object";
        Err(RemoteError::Rejected(reason.into()))
    }
}

impl MemoryRemote {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
                clock,
            }),
        }
    }

    /// Assign server-side ids to created documents instead of keeping the
    /// client's.
    pub fn with_assigned_ids(self) -> Self {
        self.lock().assign_ids = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Fail the next `n` calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.lock().failures = n;
    }

    /// Permanently reject writes to one document.
    pub fn reject(&self, collection: &str, id: &str, reason: impl Into<String>) {
        self.lock()
            .rejections
            .insert((collection.to_string(), id.to_string()), reason.into());
    }

    /// Delay every commit by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Drop feed history before `horizon`; listeners asking for older changes
    /// get [`RemoteError::CursorExpired`].
    pub fn compact(&self, horizon: Timestamp) {
        self.lock().horizon = horizon;
    }

    // ------------------------------------------------------------------
    // Direct access, as another client would write
    // ------------------------------------------------------------------

    /// Overwrite a document outside of any commit.
    pub fn write(&self, collection: &str, id: &str, payload: serde_json::Value) -> RemoteDoc {
        let mut state = self.lock();
        let doc = RemoteDoc {
            collection: collection.to_string(),
            id: id.to_string(),
            payload,
            revision: state.next_revision(),
            updated_at: self.inner.clock.now(),
            deleted: false,
        };
        self.store(&mut state, doc.clone());
        doc
    }

    /// Delete a document outside of any commit.
    pub fn delete(&self, collection: &str, id: &str) -> Option<RemoteDoc> {
        let mut state = self.lock();
        let key = (collection.to_string(), id.to_string());
        state.docs.get(&key).filter(|d| !d.deleted)?;
        let doc = RemoteDoc {
            collection: collection.to_string(),
            id: id.to_string(),
            payload: serde_json::Value::Null,
            revision: state.next_revision(),
            updated_at: self.inner.clock.now(),
            deleted: true,
        };
        self.store(&mut state, doc.clone());
        Some(doc)
    }

    /// Current state of a document, tombstones included.
    pub fn doc(&self, collection: &str, id: &str) -> Option<RemoteDoc> {
        self.lock()
            .docs
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Live documents of a collection.
    pub fn docs(&self, collection: &str) -> Vec<RemoteDoc> {
        self.lock()
            .docs
            .values()
            .filter(|d| d.collection == collection && !d.deleted)
            .cloned()
            .collect()
    }

    /// Op ids applied so far, in commit order. Replays are not repeated.
    pub fn applied_ops(&self) -> Vec<OperationId> {
        self.lock().log.clone()
    }

    /// Number of `commit_doc` calls received, failed ones included.
    pub fn commit_calls(&self) -> u64 {
        self.lock().commit_calls
    }

    fn store(&self, state: &mut State, doc: RemoteDoc) {
        let key = (doc.collection.clone(), doc.id.clone());
        let now = self.inner.clock.now();
        state.committed_at.insert(key.clone(), now);
        state.docs.insert(key, doc.clone());
        // No receivers is fine
        let _ = self.inner.changes.send(doc);
    }

    fn apply(&self, commit: Commit) -> Result<RemoteDoc, RemoteError> {
        let mut state = self.lock();
        state.commit_calls += 1;
        state.check_reachable()?;

        if let Some(key) = state.applied.get(&commit.op_id) {
            if let Some(doc) = state.docs.get(key) {
                tracing::debug!(op_id = %commit.op_id, "Replayed commit already applied");
                return Ok(doc.clone());
            }
        }

        let mut key = (commit.collection.clone(), commit.id.clone());
        if let Some(reason) = state.rejections.get(&key) {
            return Err(RemoteError::Rejected(reason.clone()));
        }

        let current = state.docs.get(&key).cloned();
        match (&commit.expected_revision, &current) {
            (None, Some(doc)) if !doc.deleted => return Err(RemoteError::conflict(doc.clone())),
            (Some(expected), Some(doc)) if doc.revision != *expected => {
                return Err(RemoteError::conflict(doc.clone()))
            }
            _ => {}
        }
        let live = current.as_ref().filter(|d| !d.deleted);

        let (payload, deleted) = match commit.mutation {
            Mutation::Set(payload) => {
                require_object(&payload)?;
                (payload, false)
            }
            Mutation::Patch(patch) => {
                require_object(&patch)?;
                let Some(doc) = live else {
                    return Err(RemoteError::Rejected("document does not exist".into()));
                };
                let mut payload = doc.payload.clone();
                merge_patch(&mut payload, &patch);
                (payload, false)
            }
            Mutation::Delete => match &current {
                None => return Err(RemoteError::Rejected("document does not exist".into())),
                Some(doc) if doc.deleted => {
                    state.applied.insert(commit.op_id.clone(), key);
                    state.log.push(commit.op_id);
                    return Ok(doc.clone());
                }
                Some(_) => (serde_json::Value::Null, true),
            },
        };

        if current.is_none() && state.assign_ids {
            state.ids += 1;
            key.1 = format!("srv-{}", state.ids);
        }

        // Documents carry the writer's time, never later than the commit.
        let doc = RemoteDoc {
            collection: key.0.clone(),
            id: key.1.clone(),
            payload,
            revision: state.next_revision(),
            updated_at: commit.issued_at.min(self.inner.clock.now()),
            deleted,
        };
        state.applied.insert(commit.op_id.clone(), key);
        state.log.push(commit.op_id);
        self.store(&mut state, doc.clone());
        Ok(doc)
    }
}

impl RemoteStore for MemoryRemote {
    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<RemoteDoc>, RemoteError> {
        let mut state = self.lock();
        state.check_reachable()?;
        Ok(state
            .docs
            .get(&(collection.to_string(), id.to_string()))
            .cloned())
    }

    async fn list_docs(&self, collection: &str) -> Result<Vec<RemoteDoc>, RemoteError> {
        let mut state = self.lock();
        state.check_reachable()?;
        Ok(state
            .docs
            .values()
            .filter(|d| d.collection == collection)
            .cloned()
            .collect())
    }

    async fn commit_doc(&self, commit: Commit) -> Result<RemoteDoc, RemoteError> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.apply(commit)
    }

    async fn listen_collection(
        &self,
        collection: &str,
        since: Option<Timestamp>,
    ) -> Result<ChangeFeed, RemoteError> {
        let (backlog, rx) = {
            let mut state = self.lock();
            state.check_reachable()?;
            let since = since.unwrap_or(0);
            if since < state.horizon {
                return Err(RemoteError::CursorExpired);
            }
            // Subscribe under the lock so no change falls between the
            // backlog and the live feed.
            let rx = self.inner.changes.subscribe();
            let mut backlog: Vec<(Timestamp, RemoteDoc)> = state
                .docs
                .iter()
                .filter(|((c, _), _)| c == collection)
                .filter_map(|(key, doc)| {
                    let at = state
                        .committed_at
                        .get(key)
                        .copied()
                        .unwrap_or(doc.updated_at);
                    (at >= since).then(|| (at, doc.clone()))
                })
                .collect();
            backlog.sort_by_key(|(at, _)| *at);
            let backlog: Vec<RemoteDoc> = backlog.into_iter().map(|(_, doc)| doc).collect();
            (backlog, rx)
        };

        let collection = collection.to_string();
        let live = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(doc) => Some((doc, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // End the feed; the listener reopens it from its cursor.
                    tracing::warn!(skipped, "Change feed lagged");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .filter(move |doc| {
            let wanted = doc.collection == collection;
            futures::future::ready(wanted)
        });

        Ok(stream::iter(backlog).chain(live).boxed())
    }
}
