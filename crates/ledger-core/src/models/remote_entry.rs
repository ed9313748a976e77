//! Remote entry payloads
//!
//! Everything coming back from the remote service passes through
//! [`RemoteEntry::try_from`], which rejects malformed rows up front instead of
//! patching missing fields deep inside reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{normalize_currency, validate_category, Entry, EntryType};
use crate::error::{Error, Result};
use crate::util::{format_timestamp, normalize_text_option, parse_timestamp};

/// A validated row from the remote service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub remote_id: String,
    pub user_id: String,
    /// `local_id` of the device that created the row, if it was client-originated
    pub client_id: Option<String>,
    pub kind: EntryType,
    pub amount: i64,
    pub category: String,
    pub note: Option<String>,
    pub currency: String,
    pub server_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub date: DateTime<Utc>,
    pub is_deleted: bool,
}

impl RemoteEntry {
    /// Decode and validate a single JSON row.
    pub fn from_json(payload: &str) -> Result<Self> {
        let wire: RemoteEntryWire = serde_json::from_str(payload)
            .map_err(|error| Error::InvalidRemotePayload(error.to_string()))?;
        wire.try_into()
    }

    /// Decode and validate a JSON array of rows; one bad row fails the batch.
    pub fn from_json_batch(payload: &str) -> Result<Vec<Self>> {
        let rows: Vec<RemoteEntryWire> = serde_json::from_str(payload)
            .map_err(|error| Error::InvalidRemotePayload(error.to_string()))?;
        rows.into_iter().map(Self::try_from).collect()
    }
}

/// Raw remote row as it appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntryWire {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: i64,
    pub category: String,
    #[serde(default)]
    pub note: Option<String>,
    pub currency: String,
    pub server_version: i64,
    pub created_at: String,
    pub updated_at: String,
    /// Rows written before `date` existed carry none; `created_at` stands in.
    #[serde(default)]
    pub date: Option<String>,
    pub deleted: bool,
}

impl TryFrom<RemoteEntryWire> for RemoteEntry {
    type Error = Error;

    fn try_from(wire: RemoteEntryWire) -> Result<Self> {
        let remote_id = required(wire.id, "id")?;
        let user_id = required(wire.user_id, "user_id")?;
        let kind = wire
            .kind
            .parse::<EntryType>()
            .map_err(|error| invalid(&remote_id, &error))?;
        if wire.amount <= 0 {
            return Err(Error::InvalidRemotePayload(format!(
                "row {remote_id}: amount must be positive, got {}",
                wire.amount
            )));
        }
        let category = validate_category(wire.category).map_err(|error| invalid(&remote_id, &error))?;
        let currency = normalize_currency(&wire.currency).map_err(|error| invalid(&remote_id, &error))?;
        if wire.server_version < 0 {
            return Err(Error::InvalidRemotePayload(format!(
                "row {remote_id}: negative server_version"
            )));
        }
        let created_at = timestamp(&remote_id, "created_at", &wire.created_at)?;
        let updated_at = timestamp(&remote_id, "updated_at", &wire.updated_at)?;
        let date = match wire.date {
            Some(date) => timestamp(&remote_id, "date", &date)?,
            None => created_at,
        };

        Ok(Self {
            remote_id,
            user_id,
            client_id: normalize_text_option(wire.client_id),
            kind,
            amount: wire.amount,
            category,
            note: normalize_text_option(wire.note),
            currency,
            server_version: wire.server_version,
            created_at,
            updated_at,
            date,
            is_deleted: wire.deleted,
        })
    }
}

impl From<&RemoteEntry> for RemoteEntryWire {
    fn from(entry: &RemoteEntry) -> Self {
        Self {
            id: entry.remote_id.clone(),
            user_id: entry.user_id.clone(),
            client_id: entry.client_id.clone(),
            kind: entry.kind.as_str().to_string(),
            amount: entry.amount,
            category: entry.category.clone(),
            note: entry.note.clone(),
            currency: entry.currency.clone(),
            server_version: entry.server_version,
            created_at: format_timestamp(entry.created_at),
            updated_at: format_timestamp(entry.updated_at),
            date: Some(format_timestamp(entry.date)),
            deleted: entry.is_deleted,
        }
    }
}

/// Outbound insert/update body built from a local row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteEntryDraft {
    pub user_id: String,
    pub client_id: String,
    #[serde(rename = "type")]
    pub kind: EntryType,
    pub amount: i64,
    pub category: String,
    pub note: Option<String>,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub date: DateTime<Utc>,
}

impl From<&Entry> for RemoteEntryDraft {
    fn from(entry: &Entry) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            client_id: entry.local_id.to_string(),
            kind: entry.kind,
            amount: entry.amount,
            category: entry.category.clone(),
            note: entry.note.clone(),
            currency: entry.currency.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
            date: entry.date,
        }
    }
}

/// Acknowledgement of a successful remote mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAck {
    pub remote_id: String,
    pub server_version: i64,
}

fn required(value: String, field: &str) -> Result<String> {
    normalize_text_option(Some(value))
        .ok_or_else(|| Error::InvalidRemotePayload(format!("missing {field}")))
}

fn timestamp(remote_id: &str, field: &str, value: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(value).ok_or_else(|| {
        Error::InvalidRemotePayload(format!("row {remote_id}: invalid {field} '{value}'"))
    })
}

fn invalid(remote_id: &str, error: &Error) -> Error {
    Error::InvalidRemotePayload(format!("row {remote_id}: {error}"))
}
