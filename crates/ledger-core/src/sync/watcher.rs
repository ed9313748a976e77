//! Background triggers: debounced local writes and the periodic timer.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{SyncCoordinator, SyncSource};
use crate::connectivity::Connectivity;
use crate::notify::{ChangeOrigin, Subscription};
use crate::remote::RemoteEntryService;

/// Handle to a background sync trigger. Stops the trigger when dropped.
#[must_use = "the trigger stops as soon as its handle is dropped"]
#[derive(Debug)]
pub struct BackgroundTrigger {
    task: JoinHandle<()>,
    _subscription: Option<Subscription>,
}

impl BackgroundTrigger {
    /// Stop the trigger. Same as dropping the handle.
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for BackgroundTrigger {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<R: RemoteEntryService, C: Connectivity> SyncCoordinator<R, C> {
    /// Schedule a `LocalWrite` cycle once local edits have been quiet for the
    /// configured debounce period.
    ///
    /// Only changes made on this device count; rows written by the sync cycle
    /// itself never re-trigger it. Must be called inside a tokio runtime.
    pub fn watch_local_changes(&self) -> BackgroundTrigger {
        let pending = Arc::new(Notify::new());
        let signal = Arc::clone(&pending);
        let subscription = self.store().subscribe(move |event| {
            if event.origin == ChangeOrigin::Local {
                signal.notify_one();
            }
        });

        let coordinator = self.clone();
        let debounce = self.settings().debounce();
        let task = tokio::spawn(async move {
            loop {
                pending.notified().await;
                // Restart the quiet period on every further write
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(debounce) => break,
                        () = pending.notified() => {}
                    }
                }
                let outcome = coordinator.schedule_sync(SyncSource::LocalWrite).await;
                tracing::debug!(?outcome, "Debounced local-change sync done");
            }
        });

        BackgroundTrigger {
            task,
            _subscription: Some(subscription),
        }
    }

    /// Run an `Interval` cycle every `interval_secs`, if configured.
    ///
    /// The first tick fires one full interval after the call. Must be called
    /// inside a tokio runtime.
    pub fn spawn_interval_sync(&self) -> Option<BackgroundTrigger> {
        let period = self.settings().interval()?;
        let coordinator = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let outcome = coordinator.schedule_sync(SyncSource::Interval).await;
                tracing::debug!(?outcome, "Interval sync done");
            }
        });

        tracing::info!(period_secs = period.as_secs(), "Interval sync enabled");
        Some(BackgroundTrigger {
            task,
            _subscription: None,
        })
    }
}
