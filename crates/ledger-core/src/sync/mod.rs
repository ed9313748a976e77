//! Offline-first synchronization between the entry store and the remote
//! service.
//!
//! A cycle pushes every outbound row, then pulls everything the server changed
//! since the stored checkpoint. Triggers come from local writes (debounced),
//! app lifecycle events, connectivity changes, and an optional interval; they
//! are all best-effort and never surface errors to the UI.

mod coordinator;
mod watcher;

use std::fmt;

pub use coordinator::SyncCoordinator;
pub use watcher::BackgroundTrigger;

/// What asked for a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncSource {
    LocalWrite,
    Foreground,
    ConnectivityRestored,
    Manual,
    Interval,
    Startup,
}

impl SyncSource {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalWrite => "local_write",
            Self::Foreground => "foreground",
            Self::ConnectivityRestored => "connectivity_restored",
            Self::Manual => "manual",
            Self::Interval => "interval",
            Self::Startup => "startup",
        }
    }
}

impl fmt::Display for SyncSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters for one `schedule_sync` call, summed over coalesced re-runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Cycles run, including re-runs requested while one was in flight
    pub cycles: usize,
    /// Rows the server acknowledged, plus local-only tombstones settled offline
    pub pushed: usize,
    /// Rows whose push failed; they stay queued for the next cycle
    pub push_failed: usize,
    /// Acknowledged rows edited again mid-cycle and left queued
    pub left_dirty: usize,
    /// Remote rows applied locally
    pub pulled: usize,
    /// Whether a pull request failed and the checkpoint stayed put
    pub pull_failed: bool,
}

impl SyncReport {
    fn absorb(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.pushed += other.pushed;
        self.push_failed += other.push_failed;
        self.left_dirty += other.left_dirty;
        self.pulled += other.pulled;
        self.pull_failed |= other.pull_failed;
    }

    /// Whether every push and the pull went through
    pub const fn is_clean(&self) -> bool {
        self.push_failed == 0 && !self.pull_failed
    }
}

/// Result of a sync request. Never an error: failures are logged and reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// This caller ran one or more cycles
    Completed(SyncReport),
    /// A cycle was already running; it will run once more on this caller's behalf
    Coalesced,
    /// The sync lock could not be acquired in time
    Skipped,
    /// No connectivity; nothing attempted
    Offline,
    /// Local persistence failed and the cycle was abandoned
    Failed(String),
}

impl SyncOutcome {
    pub const fn report(&self) -> Option<&SyncReport> {
        match self {
            Self::Completed(report) => Some(report),
            _ => None,
        }
    }
}
