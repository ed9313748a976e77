//! End-to-end sync scenarios against the in-memory remote.

use std::collections::HashSet;
use std::sync::Arc;

use ledger_core::connectivity::ConnectivityFlag;
use ledger_core::remote::MemoryRemote;
use ledger_core::{
    Entry, EntryStore, EntryType, EntryUpdate, LocalId, NewEntry, SyncCoordinator, SyncOutcome,
    SyncSettings, SyncSource, SyncState,
};
use pretty_assertions::assert_eq;

type Coordinator = SyncCoordinator<MemoryRemote, ConnectivityFlag>;

/// One device: its own store and connectivity, talking to a shared remote.
struct Device {
    store: EntryStore,
    online: Arc<ConnectivityFlag>,
    coordinator: Coordinator,
}

impl Device {
    async fn new(remote: &Arc<MemoryRemote>) -> Self {
        let store = EntryStore::open_in_memory().await.unwrap();
        let online = Arc::new(ConnectivityFlag::new(true));
        let coordinator = SyncCoordinator::new(
            store.clone(),
            Arc::clone(remote),
            Arc::clone(&online),
            "user-1",
            SyncSettings::default(),
        );
        Self {
            store,
            online,
            coordinator,
        }
    }

    async fn sync(&self) -> SyncOutcome {
        self.coordinator.schedule_sync(SyncSource::Manual).await
    }

    async fn entry(&self, local_id: &LocalId) -> Entry {
        self.store
            .get_entry_by_local_id(local_id)
            .await
            .unwrap()
            .unwrap()
    }
}

fn groceries(amount: i64) -> NewEntry {
    NewEntry::new("user-1", EntryType::Out, amount, "Groceries", "INR")
}

fn assert_completed(outcome: &SyncOutcome) {
    assert!(
        matches!(outcome, SyncOutcome::Completed(_)),
        "expected a completed sync, got {outcome:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_entry_syncs_once_online_and_edits_mark_it_dirty() {
    let remote = Arc::new(MemoryRemote::new());
    let device = Device::new(&remote).await;
    device.online.set_online(false);

    let entry = device
        .store
        .add_local_entry(groceries(1250).with_note("weekly shop"))
        .await
        .unwrap();
    assert_eq!(entry.sync_state(), Some(SyncState::LocalNew));
    assert_eq!(device.sync().await, SyncOutcome::Offline);
    assert!(remote.rows().is_empty());

    assert!(device.online.set_online(true));
    let outcome = device
        .coordinator
        .schedule_sync(SyncSource::ConnectivityRestored)
        .await;
    assert_completed(&outcome);

    let synced = device.entry(&entry.local_id).await;
    assert_eq!(synced.sync_state(), Some(SyncState::Synced));
    let remote_id = synced.remote_id.clone().unwrap();
    assert_eq!(synced.server_version, Some(1));
    assert_eq!(synced.created_at, entry.created_at);

    let edited = device
        .store
        .update_local_entry(
            &entry.local_id,
            EntryUpdate {
                amount: Some(1300),
                ..EntryUpdate::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.sync_state(), Some(SyncState::Dirty));
    assert_eq!(edited.remote_id.as_deref(), Some(remote_id.as_str()));
    assert_eq!(edited.date, entry.date);
    assert!(edited.updated_at > synced.updated_at);

    assert_completed(&device.sync().await);
    assert_eq!(remote.row(&remote_id).unwrap().amount, 1300);
    assert_eq!(
        device.entry(&entry.local_id).await.sync_state(),
        Some(SyncState::Synced)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_acknowledgement_is_reconciled_through_client_id() {
    let remote = Arc::new(MemoryRemote::new());
    let device = Device::new(&remote).await;
    let entry = device.store.add_local_entry(groceries(400)).await.unwrap();

    remote.drop_next_ack();
    let report = device.sync().await.report().copied().unwrap();
    assert_eq!(report.push_failed, 1);

    // The pull in the same cycle matched the server row to the local one
    let local = device.entry(&entry.local_id).await;
    assert_eq!(local.sync_state(), Some(SyncState::Synced));
    let rows = remote.rows();
    assert_eq!(rows.len(), 1);
    assert_eq!(local.remote_id.as_deref(), Some(rows[0].remote_id.as_str()));
    assert_eq!(rows[0].client_id.as_deref(), Some(entry.local_id.as_str()));

    assert_completed(&device.sync().await);
    assert_eq!(remote.rows().len(), 1);
    assert_eq!(device.store.get_entries("user-1").await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn outbound_list_is_exactly_the_rows_owing_work() {
    let remote = Arc::new(MemoryRemote::new());
    let device = Device::new(&remote).await;

    // Synced, then dirtied, then tombstoned after reaching the server
    let synced = device.store.add_local_entry(groceries(1)).await.unwrap();
    let dirty = device.store.add_local_entry(groceries(2)).await.unwrap();
    let tombstoned_remote = device.store.add_local_entry(groceries(3)).await.unwrap();
    let settled_tombstone = device.store.add_local_entry(groceries(4)).await.unwrap();
    assert_completed(&device.sync().await);

    device
        .store
        .update_local_entry(
            &dirty.local_id,
            EntryUpdate {
                category: Some("Dining".into()),
                ..EntryUpdate::default()
            },
        )
        .await
        .unwrap();
    device
        .store
        .mark_entry_deleted(&tombstoned_remote.local_id)
        .await
        .unwrap();
    device
        .store
        .mark_entry_deleted(&settled_tombstone.local_id)
        .await
        .unwrap();
    device
        .store
        .mark_entry_synced(&settled_tombstone.local_id, None, None)
        .await
        .unwrap();

    let local_new = device.store.add_local_entry(groceries(5)).await.unwrap();
    let tombstoned_local = device.store.add_local_entry(groceries(6)).await.unwrap();
    device
        .store
        .mark_entry_deleted(&tombstoned_local.local_id)
        .await
        .unwrap();

    let all = [
        &synced,
        &dirty,
        &tombstoned_remote,
        &settled_tombstone,
        &local_new,
        &tombstoned_local,
    ];
    let mut expected = HashSet::new();
    for entry in all {
        let row = device.entry(&entry.local_id).await;
        let owes_work =
            row.need_sync || row.is_deleted || (!row.is_synced && row.remote_id.is_none());
        assert_eq!(row.is_outbound(), owes_work);
        if owes_work {
            expected.insert(row.local_id);
        }
    }

    let outbound: HashSet<LocalId> = device
        .store
        .get_unsynced_entries()
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.local_id)
        .collect();
    assert_eq!(outbound, expected);
    assert!(!outbound.contains(&synced.local_id));
    assert!(outbound.contains(&settled_tombstone.local_id));
    assert_eq!(device.store.pending_count().await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn deletes_propagate_between_devices() {
    let remote = Arc::new(MemoryRemote::new());
    let phone = Device::new(&remote).await;
    let tablet = Device::new(&remote).await;

    let entry = phone.store.add_local_entry(groceries(900)).await.unwrap();
    assert_completed(&phone.sync().await);
    assert_completed(&tablet.sync().await);

    let on_tablet = tablet.store.get_entries("user-1").await.unwrap();
    assert_eq!(on_tablet.len(), 1);
    // A row this user created elsewhere keeps its original id
    assert_eq!(on_tablet[0].local_id, entry.local_id);

    tablet
        .store
        .mark_entry_deleted(&on_tablet[0].local_id)
        .await
        .unwrap();
    assert_completed(&tablet.sync().await);
    assert_completed(&phone.sync().await);

    let on_phone = phone.entry(&entry.local_id).await;
    assert_eq!(on_phone.sync_state(), Some(SyncState::TombstonedSynced));
    assert!(phone.store.get_entries("user-1").await.unwrap().is_empty());

    // Converged: further cycles change nothing anywhere
    let before = remote.request_counts().pushes();
    assert_completed(&phone.sync().await);
    assert_completed(&tablet.sync().await);
    assert_eq!(remote.request_counts().pushes(), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_edits_converge_on_last_write() {
    let remote = Arc::new(MemoryRemote::new());
    let phone = Device::new(&remote).await;
    let tablet = Device::new(&remote).await;

    let entry = phone.store.add_local_entry(groceries(100)).await.unwrap();
    assert_completed(&phone.sync().await);
    assert_completed(&tablet.sync().await);

    let edit = |amount| EntryUpdate {
        amount: Some(amount),
        ..EntryUpdate::default()
    };
    phone
        .store
        .update_local_entry(&entry.local_id, edit(150))
        .await
        .unwrap();
    tablet
        .store
        .update_local_entry(&entry.local_id, edit(175))
        .await
        .unwrap();

    assert_completed(&tablet.sync().await);
    assert_completed(&phone.sync().await);
    assert_completed(&tablet.sync().await);

    let on_phone = phone.entry(&entry.local_id).await;
    let on_tablet = tablet.entry(&entry.local_id).await;
    assert_eq!(on_phone.amount, 150);
    assert_eq!(on_tablet.amount, 150);
    assert_eq!(on_phone.server_version, on_tablet.server_version);
    assert_eq!(on_phone.created_at, on_tablet.created_at);
}
