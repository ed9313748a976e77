//! Remote entry service boundary.
//!
//! The coordinator talks to the backend only through [`RemoteEntryService`].
//! Implementations report connection-level failures as
//! [`Error::TransientNetwork`](crate::Error::TransientNetwork) and decode
//! everything they return through [`RemoteEntry::try_from`] so malformed rows
//! never reach reconciliation.

mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};

pub use crate::models::{RemoteAck, RemoteEntry, RemoteEntryDraft};
pub use memory::MemoryRemote;

use crate::error::Result;

/// Remote CRUD surface used by the sync coordinator
pub trait RemoteEntryService: Send + Sync + 'static {
    /// Create a row. `draft.client_id` lets the server (and a later pull)
    /// recognise a retried insert whose acknowledgement was lost.
    fn insert_entry(
        &self,
        draft: &RemoteEntryDraft,
    ) -> impl Future<Output = Result<RemoteAck>> + Send;

    /// Overwrite the mutable fields of an existing row
    fn update_entry(
        &self,
        remote_id: &str,
        draft: &RemoteEntryDraft,
    ) -> impl Future<Output = Result<RemoteAck>> + Send;

    /// Tombstone a row
    fn soft_delete_entry(&self, remote_id: &str) -> impl Future<Output = Result<RemoteAck>> + Send;

    /// Rows of `user_id` whose `updated_at` is strictly after `since`, oldest
    /// first. `None` lists everything, tombstones included.
    fn list_changed_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<RemoteEntry>>> + Send;
}
