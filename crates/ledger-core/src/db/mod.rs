//! Database layer for the ledger

mod checkpoint_repository;
mod connection;
mod entry_repository;
mod migrations;

pub use checkpoint_repository::{CheckpointRepository, LibSqlCheckpointRepository};
pub use connection::Database;
pub use entry_repository::{EntryRepository, LibSqlEntryRepository};
