//! In-process remote service.
//!
//! Behaves like the hosted backend closely enough to drive full sync cycles
//! in tests and local development: it assigns ids and versions, stamps its own
//! monotonic `updated_at`, serves pulls through the JSON decode boundary, and
//! can simulate outages, failing rows, lost acknowledgements, and edits made
//! by another device.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::RemoteEntryService;
use crate::error::{Error, Result};
use crate::models::{NewEntry, RemoteAck, RemoteEntry, RemoteEntryDraft, RemoteEntryWire};
use crate::util::{next_updated_at, now_millis};

/// Number of calls served per operation, failed ones included
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
    pub lists: usize,
}

impl RequestCounts {
    /// Calls that carried a local change to the server
    pub const fn pushes(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

#[derive(Default)]
struct State {
    rows: BTreeMap<String, RemoteEntry>,
    next_id: u64,
    clock: Option<DateTime<Utc>>,
    offline: bool,
    fail_next: usize,
    failing_clients: HashSet<String>,
    drop_next_ack: bool,
    requests: RequestCounts,
}

impl State {
    fn tick(&mut self) -> DateTime<Utc> {
        let at = self.clock.map_or_else(now_millis, next_updated_at);
        self.clock = Some(at);
        at
    }

    fn check_reachable(&mut self, client_id: Option<&str>) -> Result<()> {
        if self.offline {
            return Err(Error::TransientNetwork("remote unreachable".into()));
        }
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(Error::TransientNetwork("injected failure".into()));
        }
        if let Some(client_id) = client_id {
            if self.failing_clients.contains(client_id) {
                return Err(Error::TransientNetwork(format!(
                    "injected failure for {client_id}"
                )));
            }
        }
        Ok(())
    }

    /// Return the ack, unless the next one is set to be lost in transit.
    fn deliver(&mut self, row: &RemoteEntry) -> Result<RemoteAck> {
        if std::mem::take(&mut self.drop_next_ack) {
            return Err(Error::TransientNetwork("acknowledgement lost".into()));
        }
        Ok(RemoteAck {
            remote_id: row.remote_id.clone(),
            server_version: row.server_version,
        })
    }

    fn row_by_client_id(&self, client_id: &str) -> Option<String> {
        self.rows
            .values()
            .find(|row| !row.is_deleted && row.client_id.as_deref() == Some(client_id))
            .map(|row| row.remote_id.clone())
    }

    fn live_row_mut(&mut self, remote_id: &str) -> Result<&mut RemoteEntry> {
        match self.rows.get_mut(remote_id) {
            Some(row) if !row.is_deleted => Ok(row),
            Some(_) => Err(Error::NotFound(format!("remote entry {remote_id} is deleted"))),
            None => Err(Error::NotFound(format!("remote entry {remote_id}"))),
        }
    }

    fn apply_draft(&mut self, remote_id: &str, draft: &RemoteEntryDraft) -> Result<RemoteEntry> {
        let updated_at = self.tick();
        let row = self.live_row_mut(remote_id)?;
        row.kind = draft.kind;
        row.amount = draft.amount;
        row.category.clone_from(&draft.category);
        row.note.clone_from(&draft.note);
        row.currency.clone_from(&draft.currency);
        row.date = draft.date;
        row.server_version += 1;
        row.updated_at = updated_at;
        Ok(row.clone())
    }

    fn create(&mut self, draft: &RemoteEntryDraft) -> RemoteEntry {
        self.next_id += 1;
        let row = RemoteEntry {
            remote_id: format!("srv-{}", self.next_id),
            user_id: draft.user_id.clone(),
            client_id: Some(draft.client_id.clone()),
            kind: draft.kind,
            amount: draft.amount,
            category: draft.category.clone(),
            note: draft.note.clone(),
            currency: draft.currency.clone(),
            server_version: 1,
            created_at: draft.created_at,
            updated_at: self.tick(),
            date: draft.date,
            is_deleted: false,
        };
        self.rows.insert(row.remote_id.clone(), row.clone());
        row
    }
}

/// In-memory [`RemoteEntryService`] with failure injection
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row, tombstones included, ordered by remote id
    pub fn rows(&self) -> Vec<RemoteEntry> {
        self.state.lock().rows.values().cloned().collect()
    }

    pub fn row(&self, remote_id: &str) -> Option<RemoteEntry> {
        self.state.lock().rows.get(remote_id).cloned()
    }

    pub fn request_counts(&self) -> RequestCounts {
        self.state.lock().requests
    }

    /// Fail every call with a transient network error until switched back
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Fail the next `count` calls, whatever they are
    pub fn fail_next(&self, count: usize) {
        self.state.lock().fail_next = count;
    }

    /// Fail every push carrying this client id
    pub fn fail_client(&self, client_id: &str) {
        self.state.lock().failing_clients.insert(client_id.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.offline = false;
        state.fail_next = 0;
        state.failing_clients.clear();
        state.drop_next_ack = false;
    }

    /// Apply the next mutation but report a network failure to the caller
    pub fn drop_next_ack(&self) {
        self.state.lock().drop_next_ack = true;
    }

    /// Create a row as if another device had pushed it.
    pub fn insert_from_other_device(&self, entry: NewEntry) -> Result<RemoteEntry> {
        let entry = entry.into_entry(now_millis())?;
        let draft = RemoteEntryDraft::from(&entry);
        Ok(self.state.lock().create(&draft))
    }

    /// Edit a row as if another device had pushed the change.
    pub fn edit_from_other_device(
        &self,
        remote_id: &str,
        edit: impl FnOnce(&mut RemoteEntry),
    ) -> Result<RemoteEntry> {
        let mut state = self.state.lock();
        let updated_at = state.tick();
        let row = state.live_row_mut(remote_id)?;
        edit(row);
        row.server_version += 1;
        row.updated_at = updated_at;
        Ok(row.clone())
    }

    /// Tombstone a row as if another device had deleted it.
    pub fn delete_from_other_device(&self, remote_id: &str) -> Result<RemoteEntry> {
        self.edit_from_other_device(remote_id, |row| row.is_deleted = true)
    }
}

impl RemoteEntryService for MemoryRemote {
    async fn insert_entry(&self, draft: &RemoteEntryDraft) -> Result<RemoteAck> {
        let mut state = self.state.lock();
        state.requests.inserts += 1;
        state.check_reachable(Some(&draft.client_id))?;

        // A retried insert lands on the row its first attempt created
        let row = match state.row_by_client_id(&draft.client_id) {
            Some(remote_id) => state.apply_draft(&remote_id, draft)?,
            None => state.create(draft),
        };
        tracing::trace!(remote_id = %row.remote_id, "Remote insert");
        state.deliver(&row)
    }

    async fn update_entry(&self, remote_id: &str, draft: &RemoteEntryDraft) -> Result<RemoteAck> {
        let mut state = self.state.lock();
        state.requests.updates += 1;
        state.check_reachable(Some(&draft.client_id))?;

        let row = state.apply_draft(remote_id, draft)?;
        state.deliver(&row)
    }

    async fn soft_delete_entry(&self, remote_id: &str) -> Result<RemoteAck> {
        let mut state = self.state.lock();
        state.requests.deletes += 1;
        state.check_reachable(None)?;

        let already_deleted = match state.rows.get(remote_id) {
            Some(row) => row.is_deleted,
            None => return Err(Error::NotFound(format!("remote entry {remote_id}"))),
        };
        if !already_deleted {
            let updated_at = state.tick();
            if let Some(row) = state.rows.get_mut(remote_id) {
                row.is_deleted = true;
                row.server_version += 1;
                row.updated_at = updated_at;
            }
        }
        let row = state
            .rows
            .get(remote_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("remote entry {remote_id}")))?;
        state.deliver(&row)
    }

    async fn list_changed_since(
        &self,
        user_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteEntry>> {
        let payload = {
            let mut state = self.state.lock();
            state.requests.lists += 1;
            state.check_reachable(None)?;

            let mut changed: Vec<&RemoteEntry> = state
                .rows
                .values()
                .filter(|row| row.user_id == user_id)
                .filter(|row| since.map_or(true, |since| row.updated_at > since))
                .collect();
            changed.sort_by_key(|row| row.updated_at);
            let wire: Vec<RemoteEntryWire> =
                changed.into_iter().map(RemoteEntryWire::from).collect();
            serde_json::to_string(&wire)?
        };

        RemoteEntry::from_json_batch(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entry, EntryType, LocalId};

    fn local_entry(user_id: &str) -> Entry {
        NewEntry::new(user_id, EntryType::Out, 250, "Transport", "inr")
            .with_local_id(LocalId::generate())
            .into_entry(now_millis())
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_assigns_identity_and_version() {
        let remote = MemoryRemote::new();
        let entry = local_entry("user-1");

        let ack = remote.insert_entry(&RemoteEntryDraft::from(&entry)).await.unwrap();
        assert_eq!(ack.server_version, 1);

        let row = remote.row(&ack.remote_id).unwrap();
        assert_eq!(row.client_id.as_deref(), Some(entry.local_id.as_str()));
        assert_eq!(row.currency, "INR");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retried_insert_reuses_row() {
        let remote = MemoryRemote::new();
        let mut entry = local_entry("user-1");

        remote.drop_next_ack();
        let lost = remote.insert_entry(&RemoteEntryDraft::from(&entry)).await;
        assert!(matches!(lost, Err(Error::TransientNetwork(_))));

        entry.amount = 300;
        let ack = remote.insert_entry(&RemoteEntryDraft::from(&entry)).await.unwrap();
        assert_eq!(remote.rows().len(), 1);
        assert_eq!(ack.server_version, 2);
        assert_eq!(remote.row(&ack.remote_id).unwrap().amount, 300);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_changed_since_is_strict_and_per_user() {
        let remote = MemoryRemote::new();
        let first = remote
            .insert_from_other_device(NewEntry::new("user-1", EntryType::In, 10, "Gift", "INR"))
            .unwrap();
        let second = remote
            .insert_from_other_device(NewEntry::new("user-1", EntryType::In, 20, "Gift", "INR"))
            .unwrap();
        remote
            .insert_from_other_device(NewEntry::new("user-2", EntryType::In, 30, "Gift", "INR"))
            .unwrap();

        let all = remote.list_changed_since("user-1", None).await.unwrap();
        assert_eq!(all.len(), 2);

        let newer = remote
            .list_changed_since("user-1", Some(first.updated_at))
            .await
            .unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].remote_id, second.remote_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failure_injection() {
        let remote = MemoryRemote::new();
        let entry = local_entry("user-1");
        let draft = RemoteEntryDraft::from(&entry);

        remote.set_offline(true);
        assert!(remote.list_changed_since("user-1", None).await.is_err());
        remote.set_offline(false);

        remote.fail_next(1);
        assert!(remote.insert_entry(&draft).await.is_err());
        assert!(remote.insert_entry(&draft).await.is_ok());

        remote.fail_client(entry.local_id.as_str());
        assert!(remote.insert_entry(&draft).await.unwrap_err().is_transient());
        remote.clear_failures();
        assert!(remote.insert_entry(&draft).await.is_ok());

        assert_eq!(remote.request_counts().inserts, 4);
        assert_eq!(remote.request_counts().lists, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_deleted_rows_reject_updates_and_stay_deleted() {
        let remote = MemoryRemote::new();
        let entry = local_entry("user-1");
        let draft = RemoteEntryDraft::from(&entry);
        let ack = remote.insert_entry(&draft).await.unwrap();

        let deleted = remote.soft_delete_entry(&ack.remote_id).await.unwrap();
        let again = remote.soft_delete_entry(&ack.remote_id).await.unwrap();
        assert_eq!(deleted, again);

        let update = remote.update_entry(&ack.remote_id, &draft).await;
        assert!(matches!(update, Err(Error::NotFound(_))));
        assert!(remote.row(&ack.remote_id).unwrap().is_deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_other_device_edits_bump_updated_at() {
        let remote = MemoryRemote::new();
        let row = remote
            .insert_from_other_device(NewEntry::new("user-1", EntryType::Out, 99, "Fuel", "INR"))
            .unwrap();

        let edited = remote
            .edit_from_other_device(&row.remote_id, |row| row.amount = 120)
            .unwrap();
        assert!(edited.updated_at > row.updated_at);
        assert_eq!(edited.server_version, row.server_version + 1);

        let deleted = remote.delete_from_other_device(&row.remote_id).unwrap();
        assert!(deleted.is_deleted);
    }
}
