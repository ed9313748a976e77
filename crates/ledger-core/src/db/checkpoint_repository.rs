//! Pull checkpoint repository implementation

use chrono::{DateTime, Utc};
use libsql::Connection;

use crate::error::Result;
use crate::util::{format_timestamp, now_millis, parse_timestamp};

/// Trait for pull checkpoint storage (async)
#[allow(async_fn_in_trait)]
pub trait CheckpointRepository {
    /// Greatest remote `updated_at` already applied for the user
    async fn load(&self, user_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record that everything up to `pulled_until` has been applied
    async fn save(&self, user_id: &str, pulled_until: DateTime<Utc>) -> Result<()>;
}

/// libSQL implementation of `CheckpointRepository`
pub struct LibSqlCheckpointRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCheckpointRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl CheckpointRepository for LibSqlCheckpointRepository<'_> {
    async fn load(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        let mut rows = self
            .conn
            .query(
                "SELECT pulled_until FROM sync_checkpoints WHERE user_id = ?",
                [user_id],
            )
            .await?;

        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let value: String = row.get(0)?;
        let checkpoint = parse_timestamp(&value);
        if checkpoint.is_none() {
            // An unreadable checkpoint means a full re-pull, never a skipped window
            tracing::warn!(user_id, "Discarding unreadable pull checkpoint");
        }
        Ok(checkpoint)
    }

    async fn save(&self, user_id: &str, pulled_until: DateTime<Utc>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO sync_checkpoints (user_id, pulled_until, recorded_at)
                 VALUES (?, ?, ?)
                 ON CONFLICT(user_id) DO UPDATE SET
                     pulled_until = excluded.pulled_until,
                     recorded_at = excluded.recorded_at",
                [
                    user_id.to_string(),
                    format_timestamp(pulled_until),
                    format_timestamp(now_millis()),
                ],
            )
            .await?;
        Ok(())
    }
}
