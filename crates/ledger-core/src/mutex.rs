//! FIFO mutex with a per-acquisition timeout.
//!
//! Guards the whole multi-step sync cycle. Waiters are served strictly in
//! arrival order, a waiter that times out leaves the queue without disturbing
//! the others, and the lock is handed directly from the releasing holder to
//! the next live waiter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Default time a caller waits for the lock before giving up
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(45);

struct Waiter {
    ticket: u64,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct State {
    locked: bool,
    next_ticket: u64,
    waiters: VecDeque<Waiter>,
}

impl State {
    fn remove_waiter(&mut self, ticket: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|waiter| waiter.ticket != ticket);
        self.waiters.len() != before
    }

    /// Hand the lock to the next waiter still listening, or unlock.
    fn hand_off(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.grant.send(()).is_ok() {
                return;
            }
        }
        self.locked = false;
    }
}

/// Binary async lock with FIFO fairness and acquire timeout
#[derive(Clone)]
pub struct FifoMutex {
    state: Arc<Mutex<State>>,
    timeout: Duration,
}

impl Default for FifoMutex {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl FifoMutex {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            timeout,
        }
    }

    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Number of callers queued behind the current holder
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Wait for the lock.
    ///
    /// Returns immediately when the lock is free. Otherwise the caller joins
    /// the back of the queue and fails with [`Error::LockTimeout`] if the lock
    /// is not handed over within the configured timeout. Dropping the returned
    /// future while queued gives up the place in line; if the lock had already
    /// been handed over, it is passed on.
    pub async fn acquire(&self) -> Result<MutexGuard> {
        let mut pending = {
            let mut state = self.state.lock();
            if !state.locked {
                state.locked = true;
                return Ok(self.guard());
            }

            let ticket = state.next_ticket;
            state.next_ticket += 1;
            let (grant, receiver) = oneshot::channel();
            state.waiters.push_back(Waiter { ticket, grant });
            PendingWaiter {
                state: Arc::clone(&self.state),
                ticket,
                receiver,
                settled: false,
            }
        };

        let outcome = tokio::time::timeout(self.timeout, &mut pending.receiver).await;

        let mut state = self.state.lock();
        pending.settled = true;
        match outcome {
            Ok(Ok(())) => Ok(self.guard()),
            Ok(Err(_)) => {
                // The sender only disappears without granting when the queue was
                // torn down; treat it like a timeout.
                state.remove_waiter(pending.ticket);
                Err(Error::LockTimeout(self.timeout))
            }
            Err(_) => {
                if state.remove_waiter(pending.ticket) {
                    tracing::debug!(
                        timeout_ms = self.timeout.as_millis(),
                        "Sync lock acquisition timed out"
                    );
                    Err(Error::LockTimeout(self.timeout))
                } else {
                    // Granted between the deadline and taking the state lock
                    Ok(self.guard())
                }
            }
        }
    }

    /// Run `f` while holding the lock. The lock is released on every exit path,
    /// including a panic inside `f` or the returned future being dropped.
    pub async fn run_exclusive<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.acquire().await?;
        let result = f().await;
        guard.release();
        result
    }

    fn guard(&self) -> MutexGuard {
        MutexGuard {
            state: Some(Arc::clone(&self.state)),
        }
    }
}

impl std::fmt::Debug for FifoMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FifoMutex")
            .field("locked", &state.locked)
            .field("waiting", &state.waiters.len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Queue slot of a caller blocked in [`FifoMutex::acquire`]
struct PendingWaiter {
    state: Arc<Mutex<State>>,
    ticket: u64,
    receiver: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingWaiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = self.state.lock();
        if !state.remove_waiter(self.ticket) {
            // Already granted to this abandoned caller
            state.hand_off();
        }
    }
}

/// Proof of holding a [`FifoMutex`]; releases on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct MutexGuard {
    state: Option<Arc<Mutex<State>>>,
}

impl MutexGuard {
    /// Release the lock. Calling it more than once has no further effect.
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            state.lock().hand_off();
        }
    }

    pub const fn is_held(&self) -> bool {
        self.state.is_some()
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MutexGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard")
            .field("held", &self.is_held())
            .finish()
    }
}
