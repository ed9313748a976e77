//! Sync coordinator: push, pull, coalescing, and status reporting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use super::{SyncOutcome, SyncReport, SyncSource};
use crate::config::SyncSettings;
use crate::connectivity::Connectivity;
use crate::error::{Error, Result};
use crate::models::{Entry, RemoteAck, RemoteEntryDraft, SyncState};
use crate::mutex::FifoMutex;
use crate::notify::{EventBus, Subscription};
use crate::remote::RemoteEntryService;
use crate::services::EntryStore;

#[derive(Default)]
struct CycleState {
    running: bool,
    rerun: bool,
}

struct Inner<R, C> {
    store: EntryStore,
    remote: Arc<R>,
    connectivity: Arc<C>,
    lock: FifoMutex,
    user_id: String,
    settings: SyncSettings,
    cycle: Mutex<CycleState>,
    syncing: AtomicBool,
    status: EventBus<bool>,
}

/// Runs push/pull cycles for one signed-in user.
///
/// Cheap to clone; clones share the same lock, status, and coalescing state.
pub struct SyncCoordinator<R, C> {
    inner: Arc<Inner<R, C>>,
}

impl<R, C> Clone for SyncCoordinator<R, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteEntryService, C: Connectivity> SyncCoordinator<R, C> {
    pub fn new(
        store: EntryStore,
        remote: Arc<R>,
        connectivity: Arc<C>,
        user_id: impl Into<String>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                connectivity,
                lock: FifoMutex::new(settings.lock_timeout()),
                user_id: user_id.into(),
                settings,
                cycle: Mutex::new(CycleState::default()),
                syncing: AtomicBool::new(false),
                status: EventBus::new(),
            }),
        }
    }

    pub fn store(&self) -> &EntryStore {
        &self.inner.store
    }

    pub fn user_id(&self) -> &str {
        &self.inner.user_id
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// The lock every cycle runs under. Hold it to keep cycles out while doing
    /// other exclusive work on the store, such as signing out.
    pub fn lock(&self) -> &FifoMutex {
        &self.inner.lock
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    /// Observe running/idle transitions. `callback` is called right away with
    /// the current status, then on every change.
    pub fn subscribe_sync_status(
        &self,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> Subscription {
        let callback = Arc::new(callback);
        let listener = Arc::clone(&callback);
        let subscription = self.inner.status.subscribe(move |running| listener(*running));
        callback(self.is_syncing());
        subscription
    }

    /// Request a sync cycle.
    ///
    /// Returns once this caller's cycles are done, or immediately when the
    /// device is offline or another caller's cycle is already running (that
    /// cycle then runs once more).
    pub async fn schedule_sync(&self, source: SyncSource) -> SyncOutcome {
        if !self.inner.connectivity.is_online() {
            tracing::debug!(%source, "Offline; sync not attempted");
            return SyncOutcome::Offline;
        }

        let Some(cycle) = self.begin_cycle() else {
            tracing::debug!(%source, "Sync already running; coalesced");
            return SyncOutcome::Coalesced;
        };

        let mut guard = match self.inner.lock.acquire().await {
            Ok(guard) => guard,
            Err(error) => {
                tracing::debug!(%source, "Skipping sync: {error}");
                return SyncOutcome::Skipped;
            }
        };

        let mut total = SyncReport::default();
        let outcome = loop {
            let result = {
                let _status = StatusGuard::publish(&self.inner);
                self.sync_once().await
            };

            match result {
                Ok(report) => total.absorb(report),
                Err(error) => {
                    tracing::error!(%source, "Sync cycle failed: {error}");
                    break SyncOutcome::Failed(error.to_string());
                }
            }

            if !cycle.again() {
                break SyncOutcome::Completed(total);
            }
            if !self.inner.connectivity.is_online() {
                tracing::debug!(%source, "Went offline; dropping re-run");
                break SyncOutcome::Completed(total);
            }
        };

        guard.release();
        drop(cycle);

        if let SyncOutcome::Completed(report) = &outcome {
            tracing::info!(
                %source,
                cycles = report.cycles,
                pushed = report.pushed,
                push_failed = report.push_failed,
                pulled = report.pulled,
                pull_failed = report.pull_failed,
                "Sync finished"
            );
        }
        outcome
    }

    /// Fire-and-forget [`schedule_sync`](Self::schedule_sync) on a tokio task.
    pub fn spawn_sync(&self, source: SyncSource) -> JoinHandle<SyncOutcome> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.schedule_sync(source).await })
    }

    fn begin_cycle(&self) -> Option<RunningCycle<'_>> {
        let mut state = self.inner.cycle.lock();
        if state.running {
            state.rerun = true;
            return None;
        }
        state.running = true;
        state.rerun = false;
        Some(RunningCycle {
            cycle: &self.inner.cycle,
        })
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport {
            cycles: 1,
            ..SyncReport::default()
        };
        self.push(&mut report).await?;
        self.pull(&mut report).await?;
        Ok(report)
    }

    async fn push(&self, report: &mut SyncReport) -> Result<()> {
        // Point-in-time snapshot; rows edited from here on are caught by the
        // acknowledgement guard and pushed again next cycle
        let outbound = self.inner.store.get_unsynced_entries().await?;

        for entry in outbound {
            if entry.user_id != self.inner.user_id {
                continue;
            }

            let ack = match self.push_entry(&entry).await? {
                Pushed::Nothing => continue,
                Pushed::Remote(ack) => Some(ack),
                Pushed::SettledLocally => None,
                Pushed::Failed(error) => {
                    tracing::warn!(
                        local_id = %entry.local_id,
                        remote_id = entry.remote_id.as_deref().unwrap_or_default(),
                        "Push failed, will retry next cycle: {error}"
                    );
                    report.push_failed += 1;
                    continue;
                }
            };

            let clean = self
                .inner
                .store
                .acknowledge_push(
                    &entry.local_id,
                    ack.as_ref().map(|ack| ack.remote_id.as_str()),
                    ack.as_ref().map(|ack| ack.server_version),
                    entry.updated_at,
                )
                .await?;
            report.pushed += 1;
            if !clean {
                report.left_dirty += 1;
            }
        }
        Ok(())
    }

    async fn push_entry(&self, entry: &Entry) -> Result<Pushed> {
        let remote = &self.inner.remote;
        let result = match (entry.sync_state(), entry.remote_id.as_deref()) {
            (Some(SyncState::LocalNew), _) => {
                remote.insert_entry(&RemoteEntryDraft::from(entry)).await
            }
            (Some(SyncState::Dirty), Some(remote_id)) => {
                remote
                    .update_entry(remote_id, &RemoteEntryDraft::from(entry))
                    .await
            }
            (Some(SyncState::TombstonedLocal), Some(remote_id)) => {
                remote.soft_delete_entry(remote_id).await
            }
            // Never reached the server; nothing to delete there
            (Some(SyncState::TombstonedLocal), None) => return Ok(Pushed::SettledLocally),
            (None, _) => {
                tracing::warn!(local_id = %entry.local_id, "Entry has inconsistent sync flags");
                return Ok(Pushed::Nothing);
            }
            _ => return Ok(Pushed::Nothing),
        };

        match result {
            Ok(ack) => Ok(Pushed::Remote(ack)),
            Err(error) if error.is_persistence() => Err(error),
            Err(error) => Ok(Pushed::Failed(error)),
        }
    }

    async fn pull(&self, report: &mut SyncReport) -> Result<()> {
        let user_id = self.inner.user_id.as_str();
        let since = self.inner.store.pull_checkpoint(user_id).await?;

        let rows = match self.inner.remote.list_changed_since(user_id, since).await {
            Ok(rows) => rows,
            Err(error) if !error.is_persistence() => {
                tracing::warn!("Pull failed, checkpoint kept: {error}");
                report.pull_failed = true;
                return Ok(());
            }
            Err(error) => return Err(error),
        };

        let mut newest: Option<DateTime<Utc>> = since;
        for row in rows {
            if row.user_id != user_id {
                tracing::warn!(remote_id = %row.remote_id, "Ignoring pulled row of another user");
                continue;
            }

            let applied = row.is_deleted
                && self
                    .inner
                    .store
                    .mark_local_deleted_by_remote_id(&row.remote_id)
                    .await?;
            if !applied {
                self.inner.store.upsert_local_from_remote(&row).await?;
            }

            report.pulled += 1;
            newest = Some(newest.map_or(row.updated_at, |at| at.max(row.updated_at)));
        }

        if let Some(newest) = newest {
            if since != Some(newest) {
                self.inner.store.set_pull_checkpoint(user_id, newest).await?;
            }
        }
        Ok(())
    }
}

/// What pushing one outbound row amounted to
enum Pushed {
    /// Already in sync with the server
    Nothing,
    Remote(RemoteAck),
    /// Tombstone of a row the server never saw
    SettledLocally,
    /// Network or server rejection; the row stays queued
    Failed(Error),
}

/// Marks the coordinator busy while a caller owns the cycle loop.
struct RunningCycle<'a> {
    cycle: &'a Mutex<CycleState>,
}

impl RunningCycle<'_> {
    /// Consume a pending re-run request, or mark the loop finished.
    fn again(&self) -> bool {
        let mut state = self.cycle.lock();
        if state.rerun {
            state.rerun = false;
            true
        } else {
            state.running = false;
            false
        }
    }
}

impl Drop for RunningCycle<'_> {
    fn drop(&mut self) {
        self.cycle.lock().running = false;
    }
}

/// Publishes "syncing" on creation and "idle" on drop, whatever the cycle did.
struct StatusGuard<'a> {
    syncing: &'a AtomicBool,
    status: &'a EventBus<bool>,
}

impl<'a> StatusGuard<'a> {
    fn publish<R, C>(inner: &'a Inner<R, C>) -> Self {
        inner.syncing.store(true, Ordering::SeqCst);
        inner.status.notify(&true);
        Self {
            syncing: &inner.syncing,
            status: &inner.status,
        }
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.syncing.store(false, Ordering::SeqCst);
        self.status.notify(&false);
    }
}
