//! Sync engine configuration.
//!
//! `SyncSettings` carries the timing knobs of the coordinator. Apps either
//! ship a JSON blob next to their other build config or read the values from
//! the environment at startup.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::util::{compact_text, normalize_text_option};

const DEFAULT_DEBOUNCE_MS: u64 = 400;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 45_000;

pub const ENV_DEBOUNCE_MS: &str = "LEDGER_SYNC_DEBOUNCE_MS";
pub const ENV_LOCK_TIMEOUT_MS: &str = "LEDGER_SYNC_LOCK_TIMEOUT_MS";
pub const ENV_INTERVAL_SECS: &str = "LEDGER_SYNC_INTERVAL_SECS";

/// Timing configuration for the sync coordinator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SyncSettings {
    /// Quiet period after the last local write before a cycle is scheduled
    pub debounce_ms: u64,
    /// How long a trigger waits for the running cycle before giving up
    pub lock_timeout_ms: u64,
    /// Periodic sync; disabled when unset
    pub interval_secs: Option<u64>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            interval_secs: None,
        }
    }
}

impl SyncSettings {
    /// Parse and validate settings from a JSON payload. Missing fields keep
    /// their defaults; unknown fields are rejected.
    pub fn from_json(payload: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(payload)
            .map_err(|error| Error::Config(format!("invalid sync settings JSON: {error}")))?;
        settings.validate()
    }

    /// Build settings from a key lookup such as `std::env::var(..).ok()`.
    ///
    /// Absent or blank keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(value) = read_number(&lookup, ENV_DEBOUNCE_MS)? {
            settings.debounce_ms = value;
        }
        if let Some(value) = read_number(&lookup, ENV_LOCK_TIMEOUT_MS)? {
            settings.lock_timeout_ms = value;
        }
        if let Some(value) = read_number(&lookup, ENV_INTERVAL_SECS)? {
            settings.interval_secs = Some(value);
        }
        settings.validate()
    }

    /// Settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn validate(self) -> Result<Self> {
        if self.lock_timeout_ms == 0 {
            return Err(Error::Config("lock_timeout_ms must be greater than zero".into()));
        }
        if self.interval_secs == Some(0) {
            return Err(Error::Config("interval_secs must be greater than zero".into()));
        }
        Ok(self)
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }
}

fn read_number(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = normalize_text_option(lookup(key)) else {
        return Ok(None);
    };
    raw.parse::<u64>().map(Some).map_err(|_| {
        Error::Config(format!(
            "{key} must be a non-negative integer, got '{}'",
            compact_text(&raw)
        ))
    })
}
