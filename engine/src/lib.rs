//! # Tether Engine
//!
//! Deterministic, IO-free logic for an offline-first client cache that mirrors
//! remote document collections.
//!
//! Everything in this crate is a pure function of its inputs: the caller owns
//! storage, networking and time, and passes the current timestamp in. That
//! keeps the sync rules testable without mocks and lets the async client crate
//! decide how to persist and schedule work.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is the merged local view of one remote document:
//! - Opaque JSON payload
//! - Remote revision token (last value confirmed by the remote store)
//! - Local revision counter, bumped on every local mutation
//! - Synced revision, the local revision the remote has acknowledged
//! - Shadow copy of the last remote payload, used for three-way merges
//! - Tombstone flag for deletes that have not been confirmed yet
//!
//! ### Operations
//!
//! Local writes are queued as [`Operation`]s in an append-only log and
//! drained in `seq` order. [`select_batch`] picks the next dispatchable
//! operations without ever releasing two operations on the same record at
//! once, and [`RetryPolicy`] decides backoff and dead-lettering.
//!
//! ### Conflicts
//!
//! When the remote store rejects a commit because its revision moved, the
//! collection's [`ConflictPolicy`] decides who wins:
//! - [`ConflictPolicy::LastWriterWins`] - later wall-clock write wins (default)
//! - [`ConflictPolicy::FieldMerge`] - three-way merge against the shadow payload
//! - [`ConflictPolicy::Manual`] - park the operation for a human
//!
//! ### Leadership
//!
//! [`lease::decide`] implements the lease rules that let exactly one tab act
//! as the synchronizer.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{select_batch, NewOperation, Operation, Record};
//! use serde_json::json;
//!
//! // A local write produces a record and an operation to sync later.
//! let record = Record::new_local("tasks", "t1", json!({"title": "Read ch. 3"}), 1_000);
//! let op = NewOperation::create("op-1", "tasks", "t1", record.payload.clone(), 1, 1_000);
//! let queued = Operation::from_new(1, op);
//!
//! assert!(record.has_unsynced());
//! let batch = select_batch(vec![queued], 1_000, 10);
//! assert_eq!(batch.len(), 1);
//! ```

pub mod clock;
pub mod error;
pub mod lease;
pub mod meta;
pub mod operation;
pub mod oplog;
pub mod reconcile;
pub mod record;
pub mod schema;
pub mod snapshot;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock};
pub use error::Error;
pub use lease::{Lease, LeaseDecision, Role};
pub use meta::SyncMeta;
pub use operation::{merge_patch, Mutation, NewOperation, OpKind, OpStatus, Operation};
pub use oplog::{select_batch, FailureOutcome, RetryPolicy};
pub use reconcile::{resolve_conflict, ConflictOutcome, ConflictPolicy, ConflictResolution};
pub use record::{Record, RemoteDoc};
pub use schema::{CollectionDef, IndexDef, Schema};
pub use snapshot::{plan_resnapshot, ResnapshotPlan};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type TabId = String;
pub type OperationId = String;
/// Opaque revision token issued by the remote store.
pub type Revision = String;
/// Operation log sequence number.
pub type Seq = i64;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
pub type LocalRevision = u64;
/// Leadership generation; bumped each time the lease changes hands.
pub type Epoch = u64;
pub type SchemaVersion = u32;
