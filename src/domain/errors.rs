//! Error taxonomy for the reconciliation engine.
//!
//! Each failure domain gets its own enum so callers can tell transient
//! conditions (retry next cycle) from invariant violations (surface to the
//! caller, never swallow).

use thiserror::Error;

/// Transient failures observing the exchange. Absorbed with a counter and a
/// log line; the cycle that hit one skips classification entirely.
#[derive(Debug, Error, Clone)]
pub enum ObserverError {
    #[error("Exchange request timed out after {0}ms")]
    Timeout(u64),

    #[error("Exchange returned HTTP {status}")]
    Http { status: u16 },

    #[error("Exchange connectivity error: {0}")]
    Connectivity(String),

    #[error("Exchange request budget exhausted")]
    RateLimited,
}

/// Ledger storage and invariant errors. `Conflict` is surfaced synchronously
/// to the writer and must never be silently overwritten.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Open-trade conflict for {symbol}/{strategy}: a live record already exists")]
    Conflict { symbol: String, strategy: String },

    #[error("Timed out acquiring {lock} lock after {waited_ms}ms")]
    LockTimeout { lock: &'static str, waited_ms: u64 },

    #[error("Trade record not found: {0}")]
    NotFound(String),

    #[error("Corrupt ledger row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Ledger storage error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Storage-level errors are worth another attempt; invariant violations
    /// and lookups are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Database(_) | LedgerError::LockTimeout { .. }
        )
    }
}

/// Mirror sync failures. Non-fatal: logged, retried with backoff on the next
/// scheduled trigger, and trading continues on the local ledger.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to fetch mirror manifest: {0}")]
    Manifest(String),

    #[error("Failed to pull mirror records: {0}")]
    Pull(String),

    #[error("Failed to push records to mirror: {0}")]
    Push(String),

    #[error("Mirror belongs to environment '{remote}', local is '{local}'")]
    EnvironmentMismatch { local: String, remote: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Recovery executor failures. `PersistExhausted` is the escalation path:
/// the classification was retried to the bound and still failed, so it is
/// reported as an alert instead of being dropped.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Gave up persisting {action} for {subject} after {attempts} attempts: {last_error}")]
    PersistExhausted {
        action: &'static str,
        subject: String,
        attempts: u32,
        last_error: String,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
