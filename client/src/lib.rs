//! # Tether Client
//!
//! Offline-first local persistence and sync for the cohort dashboard.
//!
//! Every tab of the app owns a [`SyncClient`] over a shared SQLite database.
//! Writes go to the local store and an operation log in one transaction, so
//! the UI never waits on the network. One tab at a time holds a lease and runs
//! the [`SyncCoordinator`], which drains the log to the remote store, listens
//! to remote change feeds and resolves conflicts per collection policy.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tether_client::{
//!     ChangeBus, ConnectivityMonitor, Db, MemoryRemote, SyncClient, SyncConfig, SystemClock,
//! };
//! use tether_engine::Schema;
//!
//! # async fn demo() -> tether_client::Result<()> {
//! let db = Db::open_in_memory(Schema::dashboard()).await?;
//! let client = SyncClient::new(db, ChangeBus::new_shared(), Arc::new(SystemClock), "tab-1");
//!
//! let tasks = client.collection("tasks")?;
//! let id = tasks.create(json!({"title": "Read ch. 3"})).await?;
//!
//! let remote = Arc::new(MemoryRemote::new(Arc::new(SystemClock)));
//! let online = ConnectivityMonitor::new(true);
//! let mut coordinator = client.coordinator(remote, online, SyncConfig::default());
//! coordinator.sync_now().await?;
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod events;
pub mod leader;
pub mod remote;

pub use bus::ChangeBus;
pub use client::{Choice, Collection, Subscription, SyncClient, Unsubscribe};
pub use clock::SystemClock;
pub use config::{Config, ConfigError, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use coordinator::SyncCoordinator;
pub use db::Db;
pub use error::{Error, Result};
pub use events::{SyncEvent, SyncState};
pub use leader::LeaderCoordinator;
pub use remote::{ChangeFeed, Commit, MemoryRemote, RemoteError, RemoteStore};
