//! Network reachability.
//!
//! The coordinator only needs to know whether it is online and to be woken
//! when that changes. Platform glue (browser events, OS reachability APIs)
//! feeds a [`ConnectivityMonitor`].

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Source of online/offline state.
pub trait Connectivity: Send + Sync + 'static {
    fn is_online(&self) -> bool;

    /// A receiver that observes every change of the online flag.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A settable connectivity source.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(online);
        Self {
            state: Arc::new(state),
        }
    }

    /// Report the current state. Listeners are only woken on a change.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
    }

    /// Run `listener` on every change until the returned task is aborted.
    pub fn on_change<F>(&self, listener: F) -> JoinHandle<()>
    where
        F: Fn(bool) + Send + 'static,
    {
        let mut rx = self.state.subscribe();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                listener(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Connectivity for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn subscribers_see_changes() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn repeated_state_does_not_wake() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();

        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn on_change_listener_runs() {
        let monitor = ConnectivityMonitor::new(true);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let task = monitor.on_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        monitor.set_online(false);
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        task.abort();
    }
}
