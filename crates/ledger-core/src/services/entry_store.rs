//! Shared entry store used by the UI and the sync coordinator.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::db::{
    CheckpointRepository, Database, EntryRepository, LibSqlCheckpointRepository,
    LibSqlEntryRepository,
};
use crate::error::{Error, Result};
use crate::models::{Entry, EntryUpdate, LocalId, NewEntry, RemoteEntry};
use crate::notify::{ChangeBus, ChangeEvent, Subscription};

/// Thread-safe entry store. Every mutation is one transaction on the single
/// connection and is announced on the change bus once it has committed.
#[derive(Clone)]
pub struct EntryStore {
    db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
    bus: ChangeBus,
}

impl EntryStore {
    /// Open the store at the given filesystem path.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::open(&db_path).await?;
        tracing::info!("Opened entry store at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
            bus: ChangeBus::new(),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
            bus: ChangeBus::new(),
        })
    }

    /// Publish changes on an existing bus instead of a private one.
    #[must_use]
    pub fn with_bus(mut self, bus: ChangeBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    pub const fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Observe committed changes.
    pub fn subscribe(&self, listener: impl Fn(&ChangeEvent) + Send + Sync + 'static) -> Subscription {
        self.bus.subscribe(listener)
    }

    /// List a user's entries newest `date` first, tombstones hidden.
    pub async fn get_entries(&self, user_id: &str) -> Result<Vec<Entry>> {
        let db = self.db.lock().await;
        let repo = LibSqlEntryRepository::new(db.connection());
        repo.list_for_user(user_id).await
    }

    /// Fetch any row by local id, tombstones included.
    pub async fn get_entry_by_local_id(&self, local_id: &LocalId) -> Result<Option<Entry>> {
        let db = self.db.lock().await;
        let repo = LibSqlEntryRepository::new(db.connection());
        repo.get(local_id).await
    }

    /// Fetch any row by remote id, tombstones included.
    pub async fn get_entry_by_remote_id(&self, remote_id: &str) -> Result<Option<Entry>> {
        let db = self.db.lock().await;
        let repo = LibSqlEntryRepository::new(db.connection());
        repo.get_by_remote_id(remote_id).await
    }

    /// Record a new entry made on this device. It starts out unsynced.
    pub async fn add_local_entry(&self, entry: NewEntry) -> Result<Entry> {
        let entry = {
            let db = self.db.lock().await;
            let repo = LibSqlEntryRepository::new(db.connection());
            repo.insert_local(entry).await?
        };
        tracing::debug!(local_id = %entry.local_id, "Added local entry");
        self.bus.notify(&ChangeEvent::local(entry.local_id.clone()));
        Ok(entry)
    }

    /// Edit an entry and mark it for push. An empty edit returns the row as is.
    pub async fn update_local_entry(&self, local_id: &LocalId, updates: EntryUpdate) -> Result<Entry> {
        if updates.is_empty() {
            return self
                .get_entry_by_local_id(local_id)
                .await?
                .filter(|entry| !entry.is_deleted)
                .ok_or_else(|| Error::NotFound(local_id.to_string()));
        }

        let entry = {
            let db = self.db.lock().await;
            let repo = LibSqlEntryRepository::new(db.connection());
            repo.update_local(local_id, updates).await?
        };
        self.bus.notify(&ChangeEvent::local(entry.local_id.clone()));
        Ok(entry)
    }

    /// Tombstone an entry. Deleting a tombstone again changes nothing.
    pub async fn mark_entry_deleted(&self, local_id: &LocalId) -> Result<()> {
        let changed = {
            let db = self.db.lock().await;
            let repo = LibSqlEntryRepository::new(db.connection());
            repo.mark_deleted(local_id).await?
        };
        if changed {
            tracing::debug!(local_id = %local_id, "Tombstoned local entry");
            self.bus.notify(&ChangeEvent::local(local_id.clone()));
        }
        Ok(())
    }

    /// Mark an entry clean, stamping its remote identity when given.
    pub async fn mark_entry_synced(
        &self,
        local_id: &LocalId,
        remote_id: Option<&str>,
        server_version: Option<i64>,
    ) -> Result<()> {
        {
            let db = self.db.lock().await;
            let repo = LibSqlEntryRepository::new(db.connection());
            repo.mark_synced(local_id, remote_id, server_version, None)
                .await?;
        }
        self.bus.notify(&ChangeEvent::sync(local_id.clone()));
        Ok(())
    }

    /// Record a push of the snapshot taken at `pushed_updated_at`.
    ///
    /// Returns `false` when the row was edited after the snapshot; it keeps its
    /// new remote identity but stays queued for the next push.
    pub async fn acknowledge_push(
        &self,
        local_id: &LocalId,
        remote_id: Option<&str>,
        server_version: Option<i64>,
        pushed_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let clean = {
            let db = self.db.lock().await;
            let repo = LibSqlEntryRepository::new(db.connection());
            repo.mark_synced(local_id, remote_id, server_version, Some(pushed_updated_at))
                .await?
        };
        self.bus.notify(&ChangeEvent::sync(local_id.clone()));
        Ok(clean)
    }

    /// Rows the next sync cycle has to look at, oldest change first.
    pub async fn get_unsynced_entries(&self) -> Result<Vec<Entry>> {
        let db = self.db.lock().await;
        let repo = LibSqlEntryRepository::new(db.connection());
        repo.list_unsynced().await
    }

    /// Number of local changes not yet on the server
    pub async fn pending_count(&self) -> Result<usize> {
        let db = self.db.lock().await;
        let repo = LibSqlEntryRepository::new(db.connection());
        repo.count_pending().await
    }

    /// Merge a pulled row. Returns the local id it now lives under.
    pub async fn upsert_local_from_remote(&self, remote: &RemoteEntry) -> Result<LocalId> {
        let local_id = {
            let db = self.db.lock().await;
            let repo = LibSqlEntryRepository::new(db.connection());
            repo.upsert_from_remote(remote).await?
        };
        self.bus.notify(&ChangeEvent::sync(local_id.clone()));
        Ok(local_id)
    }

    /// Apply a pulled tombstone. Returns whether a local row matched.
    pub async fn mark_local_deleted_by_remote_id(&self, remote_id: &str) -> Result<bool> {
        let local_id = {
            let db = self.db.lock().await;
            let repo = LibSqlEntryRepository::new(db.connection());
            repo.mark_deleted_by_remote_id(remote_id).await?
        };
        match local_id {
            Some(local_id) => {
                self.bus.notify(&ChangeEvent::sync(local_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Greatest remote `updated_at` already applied for the user
    pub async fn pull_checkpoint(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().await;
        let repo = LibSqlCheckpointRepository::new(db.connection());
        repo.load(user_id).await
    }

    pub async fn set_pull_checkpoint(&self, user_id: &str, pulled_until: DateTime<Utc>) -> Result<()> {
        let db = self.db.lock().await;
        let repo = LibSqlCheckpointRepository::new(db.connection());
        repo.save(user_id, pulled_until).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryType, SyncState};
    use crate::notify::ChangeOrigin;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn food() -> NewEntry {
        NewEntry::new("user-1", EntryType::Out, 500, "Food", "INR")
    }

    fn record(store: &EntryStore) -> (Arc<parking_lot::Mutex<Vec<ChangeEvent>>>, Subscription) {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let subscription = store.subscribe(move |event| sink.lock().push(event.clone()));
        (events, subscription)
    }

    fn remote_row(remote_id: &str) -> RemoteEntry {
        RemoteEntry {
            remote_id: remote_id.to_string(),
            user_id: "user-1".to_string(),
            client_id: None,
            kind: EntryType::In,
            amount: 4200,
            category: "Refund".to_string(),
            note: None,
            currency: "INR".to_string(),
            server_version: 3,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap(),
            date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            is_deleted: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_then_get_round_trip() {
        let store = EntryStore::open_in_memory().await.unwrap();
        let added = store
            .add_local_entry(food().with_note("lunch"))
            .await
            .unwrap();

        let fetched = store
            .get_entry_by_local_id(&added.local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, added);
        assert_eq!(fetched.sync_state(), Some(SyncState::LocalNew));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_local_writes_notify_after_commit() {
        let store = EntryStore::open_in_memory().await.unwrap();
        let (events, _subscription) = record(&store);

        let entry = store.add_local_entry(food()).await.unwrap();
        store
            .update_local_entry(
                &entry.local_id,
                EntryUpdate {
                    amount: Some(750),
                    ..EntryUpdate::default()
                },
            )
            .await
            .unwrap();
        store.mark_entry_deleted(&entry.local_id).await.unwrap();
        store.mark_entry_deleted(&entry.local_id).await.unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|event| event.origin == ChangeOrigin::Local && event.local_id == entry.local_id));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_failed_write_does_not_notify() {
        let store = EntryStore::open_in_memory().await.unwrap();
        let (events, _subscription) = record(&store);

        let invalid = NewEntry::new("user-1", EntryType::Out, 0, "Food", "INR");
        assert!(matches!(
            store.add_local_entry(invalid).await,
            Err(Error::Validation(_))
        ));
        assert!(store
            .mark_entry_deleted(&LocalId::generate())
            .await
            .is_err());
        assert!(events.lock().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_update_is_a_quiet_no_op() {
        let store = EntryStore::open_in_memory().await.unwrap();
        let entry = store.add_local_entry(food()).await.unwrap();
        store
            .mark_entry_synced(&entry.local_id, Some("r-1"), Some(1))
            .await
            .unwrap();
        let (events, _subscription) = record(&store);

        let unchanged = store
            .update_local_entry(&entry.local_id, EntryUpdate::default())
            .await
            .unwrap();
        assert_eq!(unchanged.sync_state(), Some(SyncState::Synced));
        assert!(events.lock().is_empty());

        store.mark_entry_deleted(&entry.local_id).await.unwrap();
        let missing = store
            .update_local_entry(&entry.local_id, EntryUpdate::default())
            .await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_listener_never_fails_the_write() {
        let store = EntryStore::open_in_memory().await.unwrap();
        let _subscription = store.subscribe(|_| panic!("broken widget"));

        let entry = store.add_local_entry(food()).await.unwrap();
        assert!(store
            .get_entry_by_local_id(&entry.local_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sync_writes_notify_with_sync_origin() {
        let store = EntryStore::open_in_memory().await.unwrap();
        let entry = store.add_local_entry(food()).await.unwrap();
        let (events, _subscription) = record(&store);

        let clean = store
            .acknowledge_push(&entry.local_id, Some("r-1"), Some(1), entry.updated_at)
            .await
            .unwrap();
        assert!(clean);
        let pulled = store.upsert_local_from_remote(&remote_row("r-2")).await.unwrap();
        assert!(store.mark_local_deleted_by_remote_id("r-2").await.unwrap());
        assert!(!store.mark_local_deleted_by_remote_id("r-404").await.unwrap());

        let events = events.lock();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|event| event.origin == ChangeOrigin::Sync));
        assert_eq!(events[1].local_id, pulled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_count_and_unsynced_list() {
        let store = EntryStore::open_in_memory().await.unwrap();
        let first = store.add_local_entry(food()).await.unwrap();
        let second = store.add_local_entry(food()).await.unwrap();
        store
            .mark_entry_synced(&second.local_id, Some("r-2"), Some(1))
            .await
            .unwrap();

        assert_eq!(store.pending_count().await.unwrap(), 1);
        let unsynced = store.get_unsynced_entries().await.unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].local_id, first.local_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_checkpoint_round_trip() {
        let store = EntryStore::open_in_memory().await.unwrap();
        assert_eq!(store.pull_checkpoint("user-1").await.unwrap(), None);

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        store.set_pull_checkpoint("user-1", at).await.unwrap();
        assert_eq!(store.pull_checkpoint("user-1").await.unwrap(), Some(at));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_entries_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");

        let entry = {
            let store = EntryStore::open_path(&path).await.unwrap();
            assert_eq!(store.db_path(), Some(path.as_path()));
            store.add_local_entry(food()).await.unwrap()
        };

        let store = EntryStore::open_path(&path).await.unwrap();
        let entries = store.get_entries("user-1").await.unwrap();
        assert_eq!(entries, vec![entry]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shared_bus_sees_every_store_clone() {
        let bus = ChangeBus::new();
        let store = EntryStore::open_in_memory().await.unwrap().with_bus(bus.clone());
        let clone = store.clone();
        let events = Arc::new(parking_lot::Mutex::new(0usize));
        let sink = Arc::clone(&events);
        let _subscription = bus.subscribe(move |_| *sink.lock() += 1);

        clone.add_local_entry(food()).await.unwrap();
        assert_eq!(*events.lock(), 1);
    }
}
