use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectivityState {
    pub online: bool,
    /// Offline to online transitions seen so far. Subscribers compare it instead of
    /// `online`, since a watch receiver only ever sees the latest value.
    pub restorations: u64,
}

/// Device connectivity as reported by the host.
///
/// Cloning shares the same underlying value.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<ConnectivityState>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(ConnectivityState {
            online,
            restorations: 0,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().online
    }

    pub fn restorations(&self) -> u64 {
        self.tx.borrow().restorations
    }

    /// Records the new state; returns true on an offline to online transition.
    pub fn set_online(&self, online: bool) -> bool {
        let mut restored = false;
        let changed = self.tx.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            if online {
                state.restorations += 1;
                restored = true;
            }
            true
        });
        if changed {
            log::info!("connectivity changed: {}", if online { "online" } else { "offline" });
        }
        restored
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(false)
    }
}
