//! ledger-core - Core library for the ledger
//!
//! This crate contains the offline synchronization engine used by the ledger
//! app: the local entry store with its sync-state flags, a FIFO mutex with
//! acquire timeout, the sync coordinator running push/pull cycles, and the
//! change-notification bus that keeps readers fresh.

pub mod config;
pub mod connectivity;
pub mod db;
pub mod error;
pub mod models;
pub mod mutex;
pub mod notify;
pub mod remote;
pub mod services;
pub mod sync;
pub mod util;

pub use config::SyncSettings;
pub use connectivity::{Connectivity, ConnectivityFlag};
pub use error::{Error, Result};
pub use models::{Entry, EntryType, EntryUpdate, LocalId, NewEntry, RemoteEntry, SyncState};
pub use mutex::{FifoMutex, MutexGuard};
pub use notify::{ChangeBus, ChangeEvent, ChangeOrigin, EventBus, Subscription};
pub use remote::{MemoryRemote, RemoteEntryService};
pub use services::EntryStore;
pub use sync::{BackgroundTrigger, SyncCoordinator, SyncOutcome, SyncReport, SyncSource};
