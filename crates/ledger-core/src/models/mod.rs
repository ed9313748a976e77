//! Data models for the ledger

mod entry;
mod remote_entry;
mod sync_state;

pub use entry::{Entry, EntryType, EntryUpdate, LocalId, NewEntry};
pub use remote_entry::{RemoteAck, RemoteEntry, RemoteEntryDraft, RemoteEntryWire};
pub use sync_state::{SyncFlags, SyncState};
