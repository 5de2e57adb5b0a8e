//! Trade Ledger
//!
//! Canonical local store of trade records. All mutating operations run
//! under the single `ledger-mutation` lock shared with the order-execution
//! path, so a reconciliation cycle and a just-filled order can never race
//! into two live records for the same (symbol, strategy) key. Lock
//! acquisition is bounded: a timeout surfaces `LedgerError::LockTimeout`
//! and the caller logs and skips instead of deadlocking.

use crate::domain::entities::trade::{CloseReason, TradeRecord, TradeStatus};
use crate::domain::errors::LedgerError;
use crate::persistence::models::TradeRow;
use crate::persistence::DbPool;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Name of the ledger's exclusive mutation lock, for log lines and
/// timeout errors.
pub const MUTATION_LOCK: &str = "ledger-mutation";

/// Result of a mirror merge round.
#[derive(Debug)]
pub struct MergeOutcome {
    /// Content hash of the ledger after the merge.
    pub merged_hash: String,
    /// The full merged record set inside the hash window; what the mirror
    /// should hold after the round.
    pub merged_records: Vec<TradeRecord>,
    /// Records the mirror lacks or holds an older copy of.
    pub to_push: Vec<TradeRecord>,
    /// Remote records accepted into the local ledger.
    pub accepted: usize,
}

/// Stable subset of a record used for content hashing. The snapshot-view
/// fields (`exchange_position_ref`, `unrealized_pnl`) are cycle-local and
/// excluded so a quiet ledger hashes identically across cycles.
#[derive(Serialize)]
struct HashEntry<'a> {
    id: &'a str,
    strategy: &'a str,
    symbol: &'a str,
    side: &'a str,
    entry_price: f64,
    quantity: f64,
    margin: f64,
    leverage: u32,
    status: &'a str,
    opened_at: &'a DateTime<Utc>,
    closed_at: &'a Option<DateTime<Utc>>,
    updated_at: &'a DateTime<Utc>,
    exit_price: &'a Option<f64>,
    realized_pnl: &'a Option<f64>,
    source: &'a str,
    recovery_key: &'a Option<String>,
}

impl<'a> HashEntry<'a> {
    fn from_record(r: &'a TradeRecord) -> Self {
        Self {
            id: &r.id,
            strategy: &r.strategy,
            symbol: &r.symbol,
            side: r.side.as_str(),
            entry_price: r.entry_price,
            quantity: r.quantity,
            margin: r.margin,
            leverage: r.leverage,
            status: r.status.as_str(),
            opened_at: &r.opened_at,
            closed_at: &r.closed_at,
            updated_at: &r.updated_at,
            exit_price: &r.exit_price,
            realized_pnl: &r.realized_pnl,
            source: r.source.as_str(),
            recovery_key: &r.recovery_key,
        }
    }
}

/// Canonical trade record store.
pub struct TradeLedger {
    pool: DbPool,
    mutation: Arc<Mutex<()>>,
    lock_wait: Duration,
    hash_window: ChronoDuration,
}

impl TradeLedger {
    pub fn new(pool: DbPool, lock_wait_ms: u64, hash_recent_window_secs: u64) -> Self {
        Self {
            pool,
            mutation: Arc::new(Mutex::new(())),
            lock_wait: Duration::from_millis(lock_wait_ms),
            hash_window: ChronoDuration::seconds(hash_recent_window_secs as i64),
        }
    }

    /// Acquire the mutation lock with a bounded wait.
    async fn acquire_mutation(&self) -> Result<MutexGuard<'_, ()>, LedgerError> {
        match tokio::time::timeout(self.lock_wait, self.mutation.lock()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                warn!(
                    "Timed out waiting for {} lock after {}ms",
                    MUTATION_LOCK,
                    self.lock_wait.as_millis()
                );
                Err(LedgerError::LockTimeout {
                    lock: MUTATION_LOCK,
                    waited_ms: self.lock_wait.as_millis() as u64,
                })
            }
        }
    }

    /// Insert or update a record.
    ///
    /// Fails with `LedgerError::Conflict` when the write would create a
    /// second live record for the same (symbol, strategy) pair, unless
    /// `supersede` is set — reserved for the recovery executor resolving
    /// duplicates.
    pub async fn upsert(&self, record: &TradeRecord, supersede: bool) -> Result<(), LedgerError> {
        let _guard = self.acquire_mutation().await?;
        self.upsert_locked(record, supersede).await
    }

    async fn upsert_locked(&self, record: &TradeRecord, supersede: bool) -> Result<(), LedgerError> {
        if record.status.is_live() && !supersede {
            let conflict: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM trades \
                 WHERE symbol = ?1 AND strategy = ?2 AND id != ?3 \
                 AND status IN ('OPEN', 'ORPHAN_RECOVERED') \
                 LIMIT 1",
            )
            .bind(&record.symbol)
            .bind(&record.strategy)
            .bind(&record.id)
            .fetch_optional(&self.pool)
            .await?;

            if conflict.is_some() {
                return Err(LedgerError::Conflict {
                    symbol: record.symbol.clone(),
                    strategy: record.strategy.clone(),
                });
            }
        }

        self.write_record(record).await?;
        debug!("Upserted trade {} ({} {})", record.id, record.symbol, record.side);
        Ok(())
    }

    /// Raw write preserving the record's own timestamps; shared by upsert
    /// and the mirror merge (which must keep remote `updated_at` values).
    async fn write_record(&self, record: &TradeRecord) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, strategy, symbol, side, entry_price, quantity, margin, leverage,
                status, opened_at, closed_at, updated_at, exit_price, realized_pnl,
                exchange_position_ref, unrealized_pnl, source, recovery_key
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(id) DO UPDATE SET
                strategy = excluded.strategy,
                symbol = excluded.symbol,
                side = excluded.side,
                entry_price = excluded.entry_price,
                quantity = excluded.quantity,
                margin = excluded.margin,
                leverage = excluded.leverage,
                status = excluded.status,
                opened_at = excluded.opened_at,
                closed_at = excluded.closed_at,
                updated_at = excluded.updated_at,
                exit_price = excluded.exit_price,
                realized_pnl = excluded.realized_pnl,
                exchange_position_ref = excluded.exchange_position_ref,
                unrealized_pnl = excluded.unrealized_pnl,
                source = excluded.source,
                recovery_key = excluded.recovery_key
            "#,
        )
        .bind(&record.id)
        .bind(&record.strategy)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.entry_price)
        .bind(record.quantity)
        .bind(record.margin)
        .bind(record.leverage as i64)
        .bind(record.status.as_str())
        .bind(record.opened_at)
        .bind(record.closed_at)
        .bind(record.updated_at)
        .bind(record.exit_price)
        .bind(record.realized_pnl)
        .bind(&record.exchange_position_ref)
        .bind(record.unrealized_pnl)
        .bind(record.source.as_str())
        .bind(&record.recovery_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Live records, optionally filtered by strategy and/or symbol.
    pub async fn get_open(
        &self,
        strategy: Option<&str>,
        symbol: Option<&str>,
    ) -> Result<Vec<TradeRecord>, LedgerError> {
        let rows: Vec<TradeRow> = match (strategy, symbol) {
            (None, None) => {
                sqlx::query_as(
                    "SELECT * FROM trades WHERE status IN ('OPEN', 'ORPHAN_RECOVERED') \
                     ORDER BY opened_at ASC",
                )
                .fetch_all(&self.pool)
                .await?
            }
            (Some(strategy), None) => {
                sqlx::query_as(
                    "SELECT * FROM trades WHERE status IN ('OPEN', 'ORPHAN_RECOVERED') \
                     AND strategy = ?1 ORDER BY opened_at ASC",
                )
                .bind(strategy)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(symbol)) => {
                sqlx::query_as(
                    "SELECT * FROM trades WHERE status IN ('OPEN', 'ORPHAN_RECOVERED') \
                     AND symbol = ?1 ORDER BY opened_at ASC",
                )
                .bind(symbol)
                .fetch_all(&self.pool)
                .await?
            }
            (Some(strategy), Some(symbol)) => {
                sqlx::query_as(
                    "SELECT * FROM trades WHERE status IN ('OPEN', 'ORPHAN_RECOVERED') \
                     AND strategy = ?1 AND symbol = ?2 ORDER BY opened_at ASC",
                )
                .bind(strategy)
                .bind(symbol)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(TradeRecord::try_from).collect()
    }

    /// Fetch a single record by id.
    pub async fn get_record(&self, id: &str) -> Result<Option<TradeRecord>, LedgerError> {
        let row: Option<TradeRow> = sqlx::query_as("SELECT * FROM trades WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TradeRecord::try_from).transpose()
    }

    /// Look up a record by its adoption idempotency key.
    pub async fn get_by_recovery_key(&self, key: &str) -> Result<Option<TradeRecord>, LedgerError> {
        let row: Option<TradeRow> = sqlx::query_as("SELECT * FROM trades WHERE recovery_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(TradeRecord::try_from).transpose()
    }

    /// Transition a record to the terminal status for `reason`.
    ///
    /// Closing an already-terminal record is a no-op returning the stored
    /// record, so re-applying a classification after a crash is safe.
    pub async fn mark_closed(
        &self,
        id: &str,
        exit_price: f64,
        reason: CloseReason,
    ) -> Result<TradeRecord, LedgerError> {
        let _guard = self.acquire_mutation().await?;

        let mut record = self
            .get_record(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        if !record.status.is_live() {
            debug!("Trade {} already terminal ({}), close is a no-op", id, record.status.as_str());
            return Ok(record);
        }

        let now = Utc::now();
        record.status = reason.terminal_status();
        record.exit_price = Some(exit_price);
        record.realized_pnl = Some(record.estimate_pnl(exit_price));
        record.closed_at = Some(now);
        record.updated_at = now;
        record.exchange_position_ref = None;
        record.unrealized_pnl = None;

        self.write_record(&record).await?;
        info!(
            "Closed trade {} ({} {}) as {} at {:.8}, pnl {:.4}",
            record.id,
            record.symbol,
            record.side,
            record.status.as_str(),
            exit_price,
            record.realized_pnl.unwrap_or(0.0)
        );
        Ok(record)
    }

    /// Refresh the snapshot-view fields of a matched record. Deliberately
    /// leaves `updated_at` alone: the view is cycle-local and must not win
    /// mirror merges or churn the content hash.
    pub async fn refresh_exchange_view(
        &self,
        id: &str,
        position_ref: &str,
        unrealized_pnl: f64,
    ) -> Result<(), LedgerError> {
        let _guard = self.acquire_mutation().await?;

        let updated = sqlx::query(
            "UPDATE trades SET exchange_position_ref = ?1, unrealized_pnl = ?2 WHERE id = ?3",
        )
        .bind(position_ref)
        .bind(unrealized_pnl)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(LedgerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Deterministic content hash over all live records plus terminal
    /// records updated inside the recency window. Stable across restarts
    /// for identical data; consumed verbatim by the mirror sync.
    pub async fn compute_content_hash(&self) -> Result<String, LedgerError> {
        let _guard = self.acquire_mutation().await?;
        self.content_hash_locked().await
    }

    async fn content_hash_locked(&self) -> Result<String, LedgerError> {
        let records = self.hash_input_records().await?;
        let entries: Vec<HashEntry<'_>> = records.iter().map(HashEntry::from_record).collect();
        let serialized = serde_json::to_vec(&entries)?;
        let digest = Sha256::digest(&serialized);
        Ok(hex::encode(digest))
    }

    async fn hash_input_records(&self) -> Result<Vec<TradeRecord>, LedgerError> {
        let cutoff = Utc::now() - self.hash_window;
        let rows: Vec<TradeRow> = sqlx::query_as(
            "SELECT * FROM trades \
             WHERE status IN ('OPEN', 'ORPHAN_RECOVERED') OR updated_at >= ?1 \
             ORDER BY id ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TradeRecord::try_from).collect()
    }

    /// Merge a pulled mirror record set into the ledger, last-write-wins by
    /// `updated_at` per record id, atomically under the mutation lock.
    ///
    /// A remote live record that collides with a different local live record
    /// on (symbol, strategy) is accepted as-is; the reconciliation engine
    /// classifies the pair as DUPLICATE on the next cycle and the executor
    /// resolves it canonically.
    pub async fn sync_merge(&self, remote: Vec<TradeRecord>) -> Result<MergeOutcome, LedgerError> {
        let _guard = self.acquire_mutation().await?;

        let mut accepted = 0usize;
        let mut remote_ids: std::collections::HashMap<String, DateTime<Utc>> =
            std::collections::HashMap::with_capacity(remote.len());

        for remote_record in &remote {
            remote_ids.insert(remote_record.id.clone(), remote_record.updated_at);
            match self.get_record(&remote_record.id).await? {
                None => {
                    self.write_record(remote_record).await?;
                    accepted += 1;
                    debug!("Merge: accepted new remote trade {}", remote_record.id);
                }
                Some(local) => {
                    if remote_record.updated_at > local.updated_at {
                        self.write_record(remote_record).await?;
                        accepted += 1;
                        debug!("Merge: remote trade {} is newer, accepted", remote_record.id);
                    }
                }
            }
        }

        // Everything the mirror lacks, or holds an older copy of, goes up.
        let merged = self.hash_input_records().await?;
        let to_push: Vec<TradeRecord> = merged
            .iter()
            .filter(|record| match remote_ids.get(&record.id) {
                None => true,
                Some(remote_updated) => record.updated_at > *remote_updated,
            })
            .cloned()
            .collect();

        let merged_hash = self.content_hash_locked().await?;

        info!(
            "Merge complete: {} remote accepted, {} to push, hash {}",
            accepted,
            to_push.len(),
            &merged_hash[..12.min(merged_hash.len())]
        );

        Ok(MergeOutcome {
            merged_hash,
            merged_records: merged,
            to_push,
            accepted,
        })
    }

    /// Retention sweep: purge terminal records older than `days`. Live
    /// records are never touched.
    pub async fn purge_terminal_older_than(&self, days: u32) -> Result<u64, LedgerError> {
        let _guard = self.acquire_mutation().await?;

        let cutoff = Utc::now() - ChronoDuration::days(days as i64);
        let purged = sqlx::query(
            "DELETE FROM trades \
             WHERE status IN ('CLOSED', 'CLOSED_EXTERNALLY', 'DUPLICATE') \
             AND updated_at < ?1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if purged > 0 {
            info!("Purged {} terminal trades older than {} days", purged, days);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::trade::{TradeSide, TradeSource};
    use crate::persistence::init_database;

    fn record(id: &str, strategy: &str, symbol: &str, side: TradeSide) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: id.to_string(),
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_price: 100.0,
            quantity: 1.0,
            margin: 20.0,
            leverage: 5,
            status: TradeStatus::Open,
            opened_at: now,
            closed_at: None,
            updated_at: now,
            exit_price: None,
            realized_pnl: None,
            exchange_position_ref: None,
            unrealized_pnl: None,
            source: TradeSource::Strategy,
            recovery_key: None,
        }
    }

    async fn ledger() -> TradeLedger {
        let pool = init_database("sqlite::memory:").await.unwrap();
        TradeLedger::new(pool, 1_000, 86_400)
    }

    #[tokio::test]
    async fn upsert_and_get_open() {
        let ledger = ledger().await;
        ledger
            .upsert(&record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long), false)
            .await
            .unwrap();

        let open = ledger.get_open(None, None).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "t-1");

        let filtered = ledger.get_open(Some("rsi_oversold"), Some("BTCUSDT")).await.unwrap();
        assert_eq!(filtered.len(), 1);
        let none = ledger.get_open(Some("macd_divergence"), None).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn second_open_for_same_pair_conflicts() {
        let ledger = ledger().await;
        ledger
            .upsert(&record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long), false)
            .await
            .unwrap();

        let err = ledger
            .upsert(&record("t-2", "rsi_oversold", "BTCUSDT", TradeSide::Long), false)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict { .. }));

        // supersede is the executor's escape hatch
        ledger
            .upsert(&record("t-2", "rsi_oversold", "BTCUSDT", TradeSide::Long), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn same_symbol_different_strategy_is_fine() {
        let ledger = ledger().await;
        ledger
            .upsert(&record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long), false)
            .await
            .unwrap();
        ledger
            .upsert(&record("t-2", "macd_divergence", "BTCUSDT", TradeSide::Long), false)
            .await
            .unwrap();
        assert_eq!(ledger.get_open(None, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_closed_sets_terminal_state_and_pnl() {
        let ledger = ledger().await;
        ledger
            .upsert(&record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long), false)
            .await
            .unwrap();

        let closed = ledger
            .mark_closed("t-1", 110.0, CloseReason::ClosedExternally)
            .await
            .unwrap();
        assert_eq!(closed.status, TradeStatus::ClosedExternally);
        assert_eq!(closed.exit_price, Some(110.0));
        assert!((closed.realized_pnl.unwrap() - 10.0).abs() < 1e-9);
        assert!(closed.closed_at.is_some());

        // closing again is a no-op, not an error
        let again = ledger
            .mark_closed("t-1", 90.0, CloseReason::ClosedExternally)
            .await
            .unwrap();
        assert_eq!(again.exit_price, Some(110.0));
    }

    #[tokio::test]
    async fn mark_closed_unknown_id_is_not_found() {
        let ledger = ledger().await;
        let err = ledger
            .mark_closed("missing", 1.0, CloseReason::Filled)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn content_hash_is_deterministic_and_data_sensitive() {
        let ledger_a = ledger().await;
        let ledger_b = ledger().await;
        let rec = record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long);

        ledger_a.upsert(&rec, false).await.unwrap();
        ledger_b.upsert(&rec, false).await.unwrap();

        let hash_a = ledger_a.compute_content_hash().await.unwrap();
        let hash_b = ledger_b.compute_content_hash().await.unwrap();
        assert_eq!(hash_a, hash_b);

        ledger_b
            .upsert(&record("t-2", "macd_divergence", "ETHUSDT", TradeSide::Short), false)
            .await
            .unwrap();
        let hash_b2 = ledger_b.compute_content_hash().await.unwrap();
        assert_ne!(hash_a, hash_b2);
    }

    #[tokio::test]
    async fn view_refresh_does_not_change_hash() {
        let ledger = ledger().await;
        ledger
            .upsert(&record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long), false)
            .await
            .unwrap();

        let before = ledger.compute_content_hash().await.unwrap();
        ledger
            .refresh_exchange_view("t-1", "cycle-7:BTCUSDT:LONG", 12.5)
            .await
            .unwrap();
        let after = ledger.compute_content_hash().await.unwrap();
        assert_eq!(before, after);

        let refreshed = ledger.get_record("t-1").await.unwrap().unwrap();
        assert_eq!(refreshed.exchange_position_ref.as_deref(), Some("cycle-7:BTCUSDT:LONG"));
        assert_eq!(refreshed.unrealized_pnl, Some(12.5));
    }

    #[tokio::test]
    async fn sync_merge_last_write_wins() {
        let ledger = ledger().await;
        let mut local = record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long);
        local.updated_at = Utc::now() - ChronoDuration::seconds(60);
        ledger.upsert(&local, false).await.unwrap();

        // remote copy of t-1 is newer and closed; t-2 is remote-only
        let mut remote_t1 = local.clone();
        remote_t1.status = TradeStatus::Closed;
        remote_t1.exit_price = Some(105.0);
        remote_t1.updated_at = Utc::now();
        let remote_t2 = record("t-2", "macd_divergence", "ETHUSDT", TradeSide::Short);

        let outcome = ledger
            .sync_merge(vec![remote_t1.clone(), remote_t2.clone()])
            .await
            .unwrap();
        assert_eq!(outcome.accepted, 2);

        let merged_t1 = ledger.get_record("t-1").await.unwrap().unwrap();
        assert_eq!(merged_t1.status, TradeStatus::Closed);

        // local had nothing the mirror lacked
        assert!(outcome.to_push.is_empty());
    }

    #[tokio::test]
    async fn sync_merge_pushes_local_only_and_locally_newer() {
        let ledger = ledger().await;
        let local_only = record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long);
        ledger.upsert(&local_only, false).await.unwrap();

        let mut shared_local = record("t-2", "macd_divergence", "ETHUSDT", TradeSide::Short);
        shared_local.updated_at = Utc::now();
        ledger.upsert(&shared_local, false).await.unwrap();

        let mut shared_remote = shared_local.clone();
        shared_remote.updated_at = Utc::now() - ChronoDuration::seconds(120);

        let outcome = ledger.sync_merge(vec![shared_remote]).await.unwrap();
        assert_eq!(outcome.accepted, 0);
        let push_ids: Vec<&str> = outcome.to_push.iter().map(|r| r.id.as_str()).collect();
        assert!(push_ids.contains(&"t-1"));
        assert!(push_ids.contains(&"t-2"));
    }

    #[tokio::test]
    async fn retention_purges_only_old_terminal_records() {
        let ledger = ledger().await;
        let mut old_closed = record("t-1", "rsi_oversold", "BTCUSDT", TradeSide::Long);
        old_closed.status = TradeStatus::Closed;
        old_closed.updated_at = Utc::now() - ChronoDuration::days(60);
        ledger.upsert(&old_closed, false).await.unwrap();

        let live = record("t-2", "macd_divergence", "ETHUSDT", TradeSide::Long);
        ledger.upsert(&live, false).await.unwrap();

        let purged = ledger.purge_terminal_older_than(30).await.unwrap();
        assert_eq!(purged, 1);
        assert!(ledger.get_record("t-1").await.unwrap().is_none());
        assert!(ledger.get_record("t-2").await.unwrap().is_some());
    }
}
