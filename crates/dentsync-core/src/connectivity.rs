//! Online/offline tracking
//!
//! A single boolean, seeded from a probe at startup and flipped only through
//! [`ConnectivityMonitor::set_online`]. Observers get a `watch` receiver so a
//! flapping connection only ever shows its latest state.

use tokio::sync::watch;
use tracing::{info, warn};

/// A connectivity transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    Online,
    Offline,
}

/// Tracks whether the remote store is reachable
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self { state }
    }

    /// Seed the initial state from an environment probe
    pub fn from_probe(probe: impl FnOnce() -> bool) -> Self {
        Self::new(probe())
    }

    /// Record the current state
    ///
    /// Returns the transition, or `None` when the state did not change.
    pub fn set_online(&self, online: bool) -> Option<ConnectivityEvent> {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if !changed {
            return None;
        }

        if online {
            info!("Connection restored");
            Some(ConnectivityEvent::Online)
        } else {
            warn!("Connection lost, working offline");
            Some(ConnectivityEvent::Offline)
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let monitor = ConnectivityMonitor::new(true);
        assert!(monitor.is_online());

        assert_eq!(monitor.set_online(true), None);
        assert_eq!(monitor.set_online(false), Some(ConnectivityEvent::Offline));
        assert!(!monitor.is_online());
        assert_eq!(monitor.set_online(false), None);
        assert_eq!(monitor.set_online(true), Some(ConnectivityEvent::Online));
    }

    #[test]
    fn test_from_probe() {
        let monitor = ConnectivityMonitor::from_probe(|| false);
        assert!(!monitor.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ConnectivityMonitor::new(false);
        let mut rx = monitor.subscribe();

        let clone = monitor.clone();
        clone.set_online(true);

        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(monitor.is_online());
    }
}
