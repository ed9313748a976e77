//! Ledger entry model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::sync_state::{SyncFlags, SyncState};
use crate::error::{Error, Result};
use crate::util::normalize_text_option;

/// Prefix of local ids synthesized for rows first seen through a pull.
const REMOTE_ID_PREFIX: &str = "remote-";

/// Client-side identifier of an entry.
///
/// Generated on the device that creates the entry (UUID v7, time-sortable)
/// and never reassigned afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    /// Create a new unique local id
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Local id for a remote row that carried no client id.
    #[must_use]
    pub fn from_remote_id(remote_id: &str) -> Self {
        Self(format!("{REMOTE_ID_PREFIX}{remote_id}"))
    }

    /// Get the string representation of this id
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id was synthesized from a remote id.
    pub fn is_remote_derived(&self) -> bool {
        self.0.starts_with(REMOTE_ID_PREFIX)
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LocalId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::Validation("local_id must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Direction of money flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Income
    In,
    /// Expense
    Out,
}

impl EntryType {
    /// Stored/wire representation
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            other => Err(Error::Validation(format!(
                "entry type must be 'in' or 'out', got '{other}'"
            ))),
        }
    }
}

/// A ledger entry as stored on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Client-generated identifier
    pub local_id: LocalId,
    /// Remote identifier, set by the first successful push
    pub remote_id: Option<String>,
    /// Owning user
    pub user_id: String,
    /// Income or expense
    #[serde(rename = "type")]
    pub kind: EntryType,
    /// Amount in minor currency units
    pub amount: i64,
    /// Category label
    pub category: String,
    /// Free-form note
    pub note: Option<String>,
    /// ISO 4217 currency code
    pub currency: String,
    /// Remote revision counter
    pub server_version: Option<i64>,
    /// When the row was first established (local or remote, whichever was first)
    pub created_at: DateTime<Utc>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
    /// Effective transaction date
    pub date: DateTime<Utc>,
    /// Acknowledged by the remote service
    pub is_synced: bool,
    /// Has changes the remote service has not seen
    pub need_sync: bool,
    /// Tombstone
    pub is_deleted: bool,
}

impl Entry {
    /// Raw sync flags of this row
    pub const fn flags(&self) -> SyncFlags {
        SyncFlags {
            is_synced: self.is_synced,
            need_sync: self.need_sync,
            is_deleted: self.is_deleted,
        }
    }

    /// Sync state encoded by the flags, `None` for an invalid combination.
    pub const fn sync_state(&self) -> Option<SyncState> {
        SyncState::from_flags(self.flags(), self.remote_id.is_some())
    }

    /// Whether this row belongs on the outbound work list.
    pub const fn is_outbound(&self) -> bool {
        self.flags().is_outbound(self.remote_id.is_some())
    }
}

/// Input for `add_local_entry`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    /// Client-generated id; generated when absent
    pub local_id: Option<LocalId>,
    pub user_id: String,
    pub kind: EntryType,
    pub amount: i64,
    pub category: String,
    pub note: Option<String>,
    pub currency: String,
    /// Defaults to now
    pub created_at: Option<DateTime<Utc>>,
    /// Defaults to `created_at`
    pub date: Option<DateTime<Utc>>,
}

impl NewEntry {
    /// Create an entry input with the required fields
    pub fn new(
        user_id: impl Into<String>,
        kind: EntryType,
        amount: i64,
        category: impl Into<String>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            local_id: None,
            user_id: user_id.into(),
            kind,
            amount,
            category: category.into(),
            note: None,
            currency: currency.into(),
            created_at: None,
            date: None,
        }
    }

    #[must_use]
    pub fn with_local_id(mut self, local_id: LocalId) -> Self {
        self.local_id = Some(local_id);
        self
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    #[must_use]
    pub const fn with_date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Validate and build the row to insert, stamped with `now`.
    pub fn into_entry(self, now: DateTime<Utc>) -> Result<Entry> {
        let user_id = normalize_text_option(Some(self.user_id))
            .ok_or_else(|| Error::Validation("user_id must not be empty".into()))?;
        let created_at = self.created_at.map_or(now, crate::util::truncate_to_millis);
        let date = self.date.map_or(created_at, crate::util::truncate_to_millis);
        let flags = SyncState::LocalNew.flags();

        Ok(Entry {
            local_id: self.local_id.unwrap_or_else(LocalId::generate),
            remote_id: None,
            user_id,
            kind: self.kind,
            amount: validate_amount(self.amount)?,
            category: validate_category(self.category)?,
            note: normalize_text_option(self.note),
            currency: normalize_currency(&self.currency)?,
            server_version: None,
            created_at,
            updated_at: now,
            date,
            is_synced: flags.is_synced,
            need_sync: flags.need_sync,
            is_deleted: flags.is_deleted,
        })
    }
}

/// Partial edit for `update_local_entry`; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryUpdate {
    pub kind: Option<EntryType>,
    pub amount: Option<i64>,
    pub category: Option<String>,
    /// `Some("")` clears the note
    pub note: Option<String>,
    pub currency: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

impl EntryUpdate {
    /// Whether no field is touched
    pub const fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.amount.is_none()
            && self.category.is_none()
            && self.note.is_none()
            && self.currency.is_none()
            && self.date.is_none()
    }

    /// Apply the edit on top of `entry`, validating every touched field.
    ///
    /// Sync flags and `updated_at` are left to the caller.
    pub fn apply_to(self, entry: &mut Entry) -> Result<()> {
        if let Some(kind) = self.kind {
            entry.kind = kind;
        }
        if let Some(amount) = self.amount {
            entry.amount = validate_amount(amount)?;
        }
        if let Some(category) = self.category {
            entry.category = validate_category(category)?;
        }
        if let Some(note) = self.note {
            entry.note = normalize_text_option(Some(note));
        }
        if let Some(currency) = self.currency {
            entry.currency = normalize_currency(&currency)?;
        }
        if let Some(date) = self.date {
            entry.date = crate::util::truncate_to_millis(date);
        }
        Ok(())
    }
}

pub(crate) fn validate_amount(amount: i64) -> Result<i64> {
    if amount <= 0 {
        return Err(Error::Validation(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(amount)
}

pub(crate) fn validate_category(category: String) -> Result<String> {
    normalize_text_option(Some(category))
        .ok_or_else(|| Error::Validation("category must not be empty".into()))
}

pub(crate) fn normalize_currency(currency: &str) -> Result<String> {
    let code = currency.trim().to_ascii_uppercase();
    if code.len() == 3 && code.bytes().all(|byte| byte.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(Error::Validation(format!(
            "currency must be a 3-letter code, got '{}'",
            currency.trim()
        )))
    }
}
