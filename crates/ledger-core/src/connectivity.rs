//! Network reachability signal consulted before each sync cycle.

use std::sync::atomic::{AtomicBool, Ordering};

/// Source of the current online/offline state
pub trait Connectivity: Send + Sync + 'static {
    fn is_online(&self) -> bool;
}

/// Connectivity state fed by the platform's network callbacks
#[derive(Debug)]
pub struct ConnectivityFlag {
    online: AtomicBool,
}

impl Default for ConnectivityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityFlag {
    pub const fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    /// Record the new state. Returns `true` when this call brought the device
    /// back online, which is the moment to schedule a
    /// [`SyncSource::ConnectivityRestored`](crate::SyncSource::ConnectivityRestored) cycle.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            tracing::info!(online, "Connectivity changed");
        }
        online && !was_online
    }
}

impl Connectivity for ConnectivityFlag {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
