//! Entry repository implementation
//!
//! Every mutating method runs as one `BEGIN IMMEDIATE` … `COMMIT` transaction
//! and rolls back on any error, so a row's flags only advance together with
//! the write they describe.

use chrono::{DateTime, Utc};
use libsql::{params, Connection, Row, Value};

use crate::error::{Error, Result};
use crate::models::{Entry, EntryUpdate, LocalId, NewEntry, RemoteEntry, SyncState};
use crate::util::{format_timestamp, next_updated_at, normalize_timestamp, now_millis};

const ENTRY_COLUMNS: &str = "local_id, remote_id, user_id, type, amount, category, note, \
     currency, server_version, created_at, updated_at, date, is_synced, need_sync, is_deleted";

/// Outbound work list. This predicate is the queue; there is no queue table.
const OUTBOUND_PREDICATE: &str =
    "need_sync = 1 OR is_deleted = 1 OR (is_synced = 0 AND remote_id IS NULL)";

/// Trait for entry storage operations (async)
#[allow(async_fn_in_trait)]
pub trait EntryRepository {
    /// Non-deleted entries for a user, newest `date` first
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Entry>>;

    /// Any row by local id, tombstones included
    async fn get(&self, local_id: &LocalId) -> Result<Option<Entry>>;

    /// Any row by remote id, tombstones included
    async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Entry>>;

    /// Insert a locally created entry as `LocalNew`
    async fn insert_local(&self, entry: NewEntry) -> Result<Entry>;

    /// Apply a local edit and mark the row dirty
    async fn update_local(&self, local_id: &LocalId, updates: EntryUpdate) -> Result<Entry>;

    /// Tombstone a row. Returns `false` when it already was one.
    async fn mark_deleted(&self, local_id: &LocalId) -> Result<bool>;

    /// Record a successful push.
    ///
    /// With `pushed_updated_at` set, the row only becomes clean when it was not
    /// edited after the pushed snapshot; otherwise just the remote identity is
    /// stamped. Returns whether the row is now clean.
    async fn mark_synced(
        &self,
        local_id: &LocalId,
        remote_id: Option<&str>,
        server_version: Option<i64>,
        pushed_updated_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Rows on the outbound work list, oldest change first
    async fn list_unsynced(&self) -> Result<Vec<Entry>>;

    /// Rows that still owe the remote service a push
    async fn count_pending(&self) -> Result<usize>;

    /// Merge a remote row into the local store, returning the canonical local id
    async fn upsert_from_remote(&self, remote: &RemoteEntry) -> Result<LocalId>;

    /// Apply a remote tombstone. Returns the local id of the matching row.
    async fn mark_deleted_by_remote_id(&self, remote_id: &str) -> Result<Option<LocalId>>;
}

/// libSQL implementation of `EntryRepository`
pub struct LibSqlEntryRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlEntryRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    async fn begin(&self) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE", ()).await?;
        Ok(())
    }

    /// Commit on success, roll back on failure.
    async fn finish<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                if let Err(e) = self.conn.execute("COMMIT", ()).await {
                    self.conn.execute("ROLLBACK", ()).await.ok();
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    async fn query_entries(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Entry>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(Self::parse_entry(&row)?);
        }
        Ok(entries)
    }

    /// Parse an entry from a database row, normalizing stored timestamps
    fn parse_entry(row: &Row) -> Result<Entry> {
        let local_id: String = row.get(0)?;
        let kind: String = row.get(3)?;
        let created_at: String = row.get(9)?;
        let updated_at: String = row.get(10)?;
        let date: String = row.get(11)?;

        Ok(Entry {
            local_id: local_id.parse()?,
            remote_id: optional_text(row, 1)?,
            user_id: row.get(2)?,
            kind: kind
                .parse()
                .map_err(|_| Error::Database(format!("entry {local_id} has type '{kind}'")))?,
            amount: row.get(4)?,
            category: row.get(5)?,
            note: optional_text(row, 6)?,
            currency: row.get(7)?,
            server_version: optional_integer(row, 8)?,
            created_at: normalize_timestamp(&created_at),
            updated_at: normalize_timestamp(&updated_at),
            date: normalize_timestamp(&date),
            is_synced: row.get::<i64>(12)? != 0,
            need_sync: row.get::<i64>(13)? != 0,
            is_deleted: row.get::<i64>(14)? != 0,
        })
    }

    async fn insert_row(&self, entry: &Entry) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO entries ({ENTRY_COLUMNS})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params![
                    entry.local_id.as_str(),
                    text_or_null(entry.remote_id.as_deref()),
                    entry.user_id.as_str(),
                    entry.kind.as_str(),
                    entry.amount,
                    entry.category.as_str(),
                    text_or_null(entry.note.as_deref()),
                    entry.currency.as_str(),
                    integer_or_null(entry.server_version),
                    format_timestamp(entry.created_at),
                    format_timestamp(entry.updated_at),
                    format_timestamp(entry.date),
                    i64::from(entry.is_synced),
                    i64::from(entry.need_sync),
                    i64::from(entry.is_deleted)
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_local_inner(&self, entry: Entry) -> Result<Entry> {
        if self.get(&entry.local_id).await?.is_some() {
            return Err(Error::Validation(format!(
                "entry {} already exists",
                entry.local_id
            )));
        }
        self.insert_row(&entry).await?;
        Ok(entry)
    }

    async fn update_local_inner(&self, local_id: &LocalId, updates: EntryUpdate) -> Result<Entry> {
        let mut entry = self
            .get(local_id)
            .await?
            .filter(|entry| !entry.is_deleted)
            .ok_or_else(|| Error::NotFound(local_id.to_string()))?;

        // `date` stays whatever storage holds unless the edit names it
        updates.apply_to(&mut entry)?;
        entry.updated_at = next_updated_at(entry.updated_at);
        let flags = SyncState::Dirty.flags();
        entry.is_synced = flags.is_synced;
        entry.need_sync = flags.need_sync;

        self.conn
            .execute(
                "UPDATE entries
                 SET type = ?, amount = ?, category = ?, note = ?, currency = ?, date = ?,
                     updated_at = ?, is_synced = 0, need_sync = 1
                 WHERE local_id = ?",
                params![
                    entry.kind.as_str(),
                    entry.amount,
                    entry.category.as_str(),
                    text_or_null(entry.note.as_deref()),
                    entry.currency.as_str(),
                    format_timestamp(entry.date),
                    format_timestamp(entry.updated_at),
                    local_id.as_str()
                ],
            )
            .await?;

        Ok(entry)
    }

    async fn mark_deleted_inner(&self, local_id: &LocalId) -> Result<bool> {
        let entry = self
            .get(local_id)
            .await?
            .ok_or_else(|| Error::NotFound(local_id.to_string()))?;
        if entry.is_deleted {
            return Ok(false);
        }

        self.conn
            .execute(
                "UPDATE entries
                 SET is_deleted = 1, need_sync = 1, is_synced = 0, updated_at = ?
                 WHERE local_id = ?",
                params![
                    format_timestamp(next_updated_at(entry.updated_at)),
                    local_id.as_str()
                ],
            )
            .await?;
        Ok(true)
    }

    async fn mark_synced_inner(
        &self,
        local_id: &LocalId,
        remote_id: Option<&str>,
        server_version: Option<i64>,
        pushed_updated_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let entry = self
            .get(local_id)
            .await?
            .ok_or_else(|| Error::NotFound(local_id.to_string()))?;

        if let (Some(existing), Some(incoming)) = (entry.remote_id.as_deref(), remote_id) {
            if existing != incoming {
                tracing::warn!(
                    local_id = %local_id,
                    existing,
                    incoming,
                    "Ignoring different remote_id for an already linked entry"
                );
            }
        }

        let clean = pushed_updated_at.map_or(true, |pushed| pushed == entry.updated_at);
        let sql = if clean {
            "UPDATE entries
             SET is_synced = 1, need_sync = 0,
                 remote_id = COALESCE(remote_id, ?), server_version = COALESCE(?, server_version)
             WHERE local_id = ?"
        } else {
            "UPDATE entries
             SET remote_id = COALESCE(remote_id, ?), server_version = COALESCE(?, server_version)
             WHERE local_id = ?"
        };

        self.conn
            .execute(
                sql,
                params![
                    text_or_null(remote_id),
                    integer_or_null(server_version),
                    local_id.as_str()
                ],
            )
            .await?;

        if !clean {
            tracing::debug!(local_id = %local_id, "Entry changed during push; left dirty");
        }
        Ok(clean)
    }

    /// Find the local row a remote row belongs to: by remote id first, then
    /// by the client id this device pushed it with.
    async fn find_reconciliation_target(&self, remote: &RemoteEntry) -> Result<Option<Entry>> {
        if let Some(entry) = self.get_by_remote_id(&remote.remote_id).await? {
            return Ok(Some(entry));
        }

        let Some(client_id) = remote.client_id.as_deref() else {
            return Ok(None);
        };
        let Some(entry) = self.get(&client_id.parse()?).await? else {
            return Ok(None);
        };

        match entry.remote_id.as_deref() {
            None => Ok(Some(entry)),
            Some(other) => {
                tracing::warn!(
                    local_id = %entry.local_id,
                    linked = other,
                    incoming = %remote.remote_id,
                    "client_id already linked to a different remote row"
                );
                Ok(None)
            }
        }
    }

    async fn upsert_from_remote_inner(&self, remote: &RemoteEntry) -> Result<LocalId> {
        if let Some(entry) = self.find_reconciliation_target(remote).await? {
            self.reconcile_existing(&entry, remote).await?;
            return Ok(entry.local_id);
        }

        let local_id = match remote.client_id.as_deref() {
            Some(client_id) if self.get(&client_id.parse()?).await?.is_none() => client_id.parse()?,
            _ => LocalId::from_remote_id(&remote.remote_id),
        };
        let state = if remote.is_deleted {
            SyncState::TombstonedSynced
        } else {
            SyncState::Synced
        };
        let flags = state.flags();

        self.insert_row(&Entry {
            local_id: local_id.clone(),
            remote_id: Some(remote.remote_id.clone()),
            user_id: remote.user_id.clone(),
            kind: remote.kind,
            amount: remote.amount,
            category: remote.category.clone(),
            note: remote.note.clone(),
            currency: remote.currency.clone(),
            server_version: Some(remote.server_version),
            created_at: remote.created_at,
            updated_at: remote.updated_at,
            date: remote.date,
            is_synced: flags.is_synced,
            need_sync: flags.need_sync,
            is_deleted: flags.is_deleted,
        })
        .await?;

        tracing::debug!(local_id = %local_id, remote_id = %remote.remote_id, "Inserted pulled entry");
        Ok(local_id)
    }

    /// Remote wins every mutable field except `created_at`; tombstones stay put.
    async fn reconcile_existing(&self, entry: &Entry, remote: &RemoteEntry) -> Result<()> {
        if entry.is_deleted {
            let sql = if remote.is_deleted {
                "UPDATE entries
                 SET remote_id = COALESCE(remote_id, ?), server_version = ?,
                     is_synced = 1, need_sync = 0
                 WHERE local_id = ?"
            } else {
                // Local delete not pushed yet; keep it pending
                "UPDATE entries
                 SET remote_id = COALESCE(remote_id, ?), server_version = ?
                 WHERE local_id = ?"
            };
            self.conn
                .execute(
                    sql,
                    params![
                        remote.remote_id.as_str(),
                        remote.server_version,
                        entry.local_id.as_str()
                    ],
                )
                .await?;
            return Ok(());
        }

        if entry.need_sync && is_own_echo(entry, remote) {
            let settled = same_content(entry, remote);
            let sql = if settled {
                "UPDATE entries
                 SET remote_id = COALESCE(remote_id, ?), server_version = COALESCE(server_version, ?),
                     is_synced = 1, need_sync = 0
                 WHERE local_id = ?"
            } else {
                "UPDATE entries
                 SET remote_id = COALESCE(remote_id, ?), server_version = COALESCE(server_version, ?)
                 WHERE local_id = ?"
            };
            self.conn
                .execute(
                    sql,
                    params![
                        remote.remote_id.as_str(),
                        remote.server_version,
                        entry.local_id.as_str()
                    ],
                )
                .await?;
            if !settled {
                tracing::debug!(
                    local_id = %entry.local_id,
                    server_version = remote.server_version,
                    "Pulled echo of own push; keeping newer local edit"
                );
            }
            return Ok(());
        }

        if entry.need_sync {
            tracing::info!(
                local_id = %entry.local_id,
                remote_id = %remote.remote_id,
                "Remote change overrides unpushed local edit"
            );
        }

        self.conn
            .execute(
                "UPDATE entries
                 SET remote_id = COALESCE(remote_id, ?), type = ?, amount = ?, category = ?,
                     note = ?, currency = ?, server_version = ?, updated_at = ?, date = ?,
                     is_deleted = ?, is_synced = 1, need_sync = 0
                 WHERE local_id = ?",
                params![
                    remote.remote_id.as_str(),
                    remote.kind.as_str(),
                    remote.amount,
                    remote.category.as_str(),
                    text_or_null(remote.note.as_deref()),
                    remote.currency.as_str(),
                    remote.server_version,
                    format_timestamp(remote.updated_at),
                    format_timestamp(remote.date),
                    i64::from(remote.is_deleted),
                    entry.local_id.as_str()
                ],
            )
            .await?;
        Ok(())
    }

    async fn mark_deleted_by_remote_id_inner(&self, remote_id: &str) -> Result<Option<LocalId>> {
        let Some(entry) = self.get_by_remote_id(remote_id).await? else {
            return Ok(None);
        };

        self.conn
            .execute(
                "UPDATE entries SET is_deleted = 1, is_synced = 1, need_sync = 0 WHERE remote_id = ?",
                [remote_id],
            )
            .await?;
        Ok(Some(entry.local_id))
    }
}

impl EntryRepository for LibSqlEntryRepository<'_> {
    async fn list_for_user(&self, user_id: &str) -> Result<Vec<Entry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 WHERE user_id = ? AND is_deleted = 0
                 ORDER BY date DESC, created_at DESC"
            ),
            [user_id],
        )
        .await
    }

    async fn get(&self, local_id: &LocalId) -> Result<Option<Entry>> {
        let mut entries = self
            .query_entries(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE local_id = ?"),
                [local_id.as_str()],
            )
            .await?;
        Ok(entries.pop())
    }

    async fn get_by_remote_id(&self, remote_id: &str) -> Result<Option<Entry>> {
        let mut entries = self
            .query_entries(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE remote_id = ?"),
                [remote_id],
            )
            .await?;
        Ok(entries.pop())
    }

    async fn insert_local(&self, entry: NewEntry) -> Result<Entry> {
        // Validation happens before the transaction opens
        let entry = entry.into_entry(now_millis())?;
        self.begin().await?;
        let result = self.insert_local_inner(entry).await;
        self.finish(result).await
    }

    async fn update_local(&self, local_id: &LocalId, updates: EntryUpdate) -> Result<Entry> {
        self.begin().await?;
        let result = self.update_local_inner(local_id, updates).await;
        self.finish(result).await
    }

    async fn mark_deleted(&self, local_id: &LocalId) -> Result<bool> {
        self.begin().await?;
        let result = self.mark_deleted_inner(local_id).await;
        self.finish(result).await
    }

    async fn mark_synced(
        &self,
        local_id: &LocalId,
        remote_id: Option<&str>,
        server_version: Option<i64>,
        pushed_updated_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.begin().await?;
        let result = self
            .mark_synced_inner(local_id, remote_id, server_version, pushed_updated_at)
            .await;
        self.finish(result).await
    }

    async fn list_unsynced(&self) -> Result<Vec<Entry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 WHERE {OUTBOUND_PREDICATE}
                 ORDER BY updated_at ASC"
            ),
            (),
        )
        .await
    }

    async fn count_pending(&self) -> Result<usize> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM entries WHERE need_sync = 1", ())
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        usize::try_from(count).map_err(|_| Error::Database(format!("invalid count {count}")))
    }

    async fn upsert_from_remote(&self, remote: &RemoteEntry) -> Result<LocalId> {
        self.begin().await?;
        let result = self.upsert_from_remote_inner(remote).await;
        self.finish(result).await
    }

    async fn mark_deleted_by_remote_id(&self, remote_id: &str) -> Result<Option<LocalId>> {
        self.begin().await?;
        let result = self.mark_deleted_by_remote_id_inner(remote_id).await;
        self.finish(result).await
    }
}

/// Whether a pulled row is this device's own push coming back, so a pending
/// local edit must not be overwritten by it.
fn is_own_echo(entry: &Entry, remote: &RemoteEntry) -> bool {
    if remote.is_deleted {
        return false;
    }
    match (entry.remote_id.as_deref(), entry.server_version) {
        (_, Some(known)) => remote.server_version <= known,
        // Insert acknowledgement lost; matched through client_id. Only a
        // local edit at or after the server's write keeps the local content.
        (None, None) => entry.updated_at >= remote.updated_at,
        (Some(_), None) => false,
    }
}

fn same_content(entry: &Entry, remote: &RemoteEntry) -> bool {
    entry.kind == remote.kind
        && entry.amount == remote.amount
        && entry.category == remote.category
        && entry.note == remote.note
        && entry.currency == remote.currency
        && entry.date == remote.date
}

fn optional_text(row: &Row, idx: i32) -> Result<Option<String>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Text(text) => Ok(Some(text)),
        other => Err(Error::Database(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
    }
}

fn optional_integer(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Database(format!(
            "column {idx}: expected integer, got {other:?}"
        ))),
    }
}

fn text_or_null(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

fn integer_or_null(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}
