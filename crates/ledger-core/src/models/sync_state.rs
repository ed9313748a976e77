//! Entry sync-state machine
//!
//! ```text
//! LocalNew -> (push) -> Synced <-> Dirty -> (push) -> Synced
//!    |                    |          |
//!    +--------------------+----------+--> TombstonedLocal -> (push) -> TombstonedSynced
//! ```
//!
//! Pulled rows enter at `Synced` or `TombstonedSynced`. Nothing leaves a
//! tombstoned state. The in-flight push phase is never persisted.

use serde::{Deserialize, Serialize};

/// The three persisted flags of an entry row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncFlags {
    pub is_synced: bool,
    pub need_sync: bool,
    pub is_deleted: bool,
}

impl SyncFlags {
    /// Outbound work-list predicate:
    /// `need_sync OR is_deleted OR (NOT is_synced AND remote_id IS NULL)`.
    pub const fn is_outbound(self, has_remote_id: bool) -> bool {
        self.need_sync || self.is_deleted || (!self.is_synced && !has_remote_id)
    }
}

/// Persisted sync state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Created on this device, never pushed
    LocalNew,
    /// Pushed before, edited since
    Dirty,
    /// Matches the remote copy
    Synced,
    /// Deleted on this device, deletion not pushed yet
    TombstonedLocal,
    /// Deletion acknowledged; terminal
    TombstonedSynced,
}

impl SyncState {
    /// Decode the flag tuple. Any combination outside the machine is `None`.
    pub const fn from_flags(flags: SyncFlags, has_remote_id: bool) -> Option<Self> {
        match (flags.is_synced, flags.need_sync, flags.is_deleted) {
            (false, true, false) if has_remote_id => Some(Self::Dirty),
            (false, true, false) => Some(Self::LocalNew),
            (true, false, false) => Some(Self::Synced),
            (false, true, true) => Some(Self::TombstonedLocal),
            (true, false, true) => Some(Self::TombstonedSynced),
            _ => None,
        }
    }

    /// Flag tuple persisted for this state
    pub const fn flags(self) -> SyncFlags {
        let (is_synced, need_sync, is_deleted) = match self {
            Self::LocalNew | Self::Dirty => (false, true, false),
            Self::Synced => (true, false, false),
            Self::TombstonedLocal => (false, true, true),
            Self::TombstonedSynced => (true, false, true),
        };
        SyncFlags {
            is_synced,
            need_sync,
            is_deleted,
        }
    }

    /// Whether a push is still owed to the remote service
    pub const fn needs_push(self) -> bool {
        matches!(self, Self::LocalNew | Self::Dirty | Self::TombstonedLocal)
    }

    pub const fn is_tombstone(self) -> bool {
        matches!(self, Self::TombstonedLocal | Self::TombstonedSynced)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::TombstonedSynced)
    }
}
