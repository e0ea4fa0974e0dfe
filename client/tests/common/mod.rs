#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tether_client::{
    ChangeBus, ConnectivityMonitor, Db, MemoryRemote, SyncClient, SyncConfig, SyncCoordinator,
};
use tether_engine::{ManualClock, Operation, RetryPolicy, Schema, Seq, Timestamp};

pub const START: Timestamp = 1_700_000_000_000;

/// How often test subscriptions look for writes from tabs on another bus.
pub const POLL: Duration = Duration::from_millis(50);

/// One tab: its client handle, its coordinator and its network switch.
pub struct Tab {
    pub client: SyncClient,
    pub coordinator: SyncCoordinator<MemoryRemote, ConnectivityMonitor>,
    pub net: ConnectivityMonitor,
}

impl Tab {
    pub async fn op(&self, seq: Seq) -> Operation {
        self.client.db().operation(seq).await.unwrap()
    }
}

pub fn config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy {
            base_ms: 100,
            cap_ms: 1_000,
            max_attempts: 3,
        },
        ..SyncConfig::default()
    }
}

pub fn remote(clock: &ManualClock) -> Arc<MemoryRemote> {
    Arc::new(MemoryRemote::new(Arc::new(clock.clone())))
}

/// A tab on its own private database, as on a separate device.
pub async fn device(remote: &Arc<MemoryRemote>, clock: &ManualClock, tab_id: &str) -> Tab {
    device_with(Schema::dashboard(), remote, clock, tab_id).await
}

pub async fn device_with(
    schema: Schema,
    remote: &Arc<MemoryRemote>,
    clock: &ManualClock,
    tab_id: &str,
) -> Tab {
    let db = Db::open_in_memory(schema).await.unwrap();
    tab(db, ChangeBus::new_shared(), remote, clock, tab_id)
}

/// A tab on a database file other tabs may share.
pub async fn tab_on(
    path: &Path,
    bus: Arc<ChangeBus>,
    remote: &Arc<MemoryRemote>,
    clock: &ManualClock,
    tab_id: &str,
) -> Tab {
    let db = Db::open_file(path, Schema::dashboard()).await.unwrap();
    tab(db, bus, remote, clock, tab_id)
}

fn tab(
    db: Db,
    bus: Arc<ChangeBus>,
    remote: &Arc<MemoryRemote>,
    clock: &ManualClock,
    tab_id: &str,
) -> Tab {
    let clock = Arc::new(clock.clone());
    let client = SyncClient::new(db, bus, clock, tab_id).with_poll_interval(POLL);
    let net = ConnectivityMonitor::new(true);
    let coordinator = client.coordinator(remote.clone(), net.clone(), config());
    Tab {
        client,
        coordinator,
        net,
    }
}
