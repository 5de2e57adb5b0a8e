//! Sync state for the cloud mirror, one instance per deployment environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent sync bookkeeping. After a successful round
/// `local_hash == remote_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub environment: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub sync_interval_secs: u64,
}

impl SyncState {
    pub fn new(environment: impl Into<String>, sync_interval_secs: u64) -> Self {
        Self {
            environment: environment.into(),
            last_sync_time: None,
            local_hash: None,
            remote_hash: None,
            sync_interval_secs,
        }
    }

    /// Derived, never stored: a round is due when the interval elapsed or
    /// the two hashes disagree.
    pub fn should_sync(&self, now: DateTime<Utc>) -> bool {
        let interval_elapsed = match self.last_sync_time {
            None => true,
            Some(last) => {
                (now - last).num_seconds() >= self.sync_interval_secs as i64
            }
        };
        interval_elapsed || self.local_hash != self.remote_hash
    }
}
