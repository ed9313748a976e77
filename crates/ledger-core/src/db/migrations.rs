//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    tracing::debug!("Database schema at version {CURRENT_VERSION}");
    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    // Check if schema_version table exists
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Run `statements` in one transaction, rolling back on the first failure.
async fn apply(conn: &Connection, version: i32, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn
        .execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .await
    {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    tracing::info!("Migrated database to version {version}");
    Ok(())
}

/// Migration to version 1: entries table and its sync-state invariants
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        1,
        &[
            // Schema version tracking
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // Entries table. Exactly one of is_synced/need_sync is set, which
            // leaves the four valid (is_synced, need_sync, is_deleted) states.
            "CREATE TABLE IF NOT EXISTS entries (
                local_id TEXT PRIMARY KEY,
                remote_id TEXT,
                user_id TEXT NOT NULL,
                type TEXT NOT NULL CHECK (type IN ('in', 'out')),
                amount INTEGER NOT NULL CHECK (amount > 0),
                category TEXT NOT NULL,
                note TEXT,
                currency TEXT NOT NULL,
                server_version INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                date TEXT NOT NULL,
                is_synced INTEGER NOT NULL DEFAULT 0 CHECK (is_synced IN (0, 1)),
                need_sync INTEGER NOT NULL DEFAULT 1 CHECK (need_sync IN (0, 1)),
                is_deleted INTEGER NOT NULL DEFAULT 0 CHECK (is_deleted IN (0, 1)),
                CHECK (is_synced + need_sync = 1)
            )",
            "CREATE INDEX IF NOT EXISTS idx_entries_user_date ON entries(user_id, date DESC)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_remote_id
                ON entries(remote_id) WHERE remote_id IS NOT NULL",
            "CREATE INDEX IF NOT EXISTS idx_entries_outbound ON entries(need_sync, is_deleted)",
            // remote_id is assigned at most once
            "CREATE TRIGGER IF NOT EXISTS entries_remote_id_immutable
             BEFORE UPDATE OF remote_id ON entries
             FOR EACH ROW
             WHEN OLD.remote_id IS NOT NULL AND NEW.remote_id IS NOT OLD.remote_id
             BEGIN
                 SELECT RAISE(ABORT, 'remote_id is immutable once assigned');
             END",
            "CREATE TRIGGER IF NOT EXISTS entries_created_at_immutable
             BEFORE UPDATE OF created_at ON entries
             FOR EACH ROW
             WHEN NEW.created_at IS NOT OLD.created_at
             BEGIN
                 SELECT RAISE(ABORT, 'created_at is immutable');
             END",
            // Nothing leaves a tombstone
            "CREATE TRIGGER IF NOT EXISTS entries_tombstone_terminal
             BEFORE UPDATE OF is_deleted ON entries
             FOR EACH ROW
             WHEN OLD.is_deleted = 1 AND NEW.is_deleted = 0
             BEGIN
                 SELECT RAISE(ABORT, 'tombstoned entries cannot be restored');
             END",
            "CREATE TRIGGER IF NOT EXISTS entries_no_hard_delete
             BEFORE DELETE ON entries
             BEGIN
                 SELECT RAISE(ABORT, 'entries are soft-deleted only');
             END",
        ],
    )
    .await
}

/// Migration to version 2: incremental pull checkpoints
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        2,
        &["CREATE TABLE IF NOT EXISTS sync_checkpoints (
            user_id TEXT PRIMARY KEY,
            pulled_until TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        )"],
    )
    .await
}
