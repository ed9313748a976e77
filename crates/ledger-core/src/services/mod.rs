//! Application-facing services

mod entry_store;

pub use entry_store::EntryStore;
