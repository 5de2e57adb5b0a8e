//! Recovery Action Executor
//!
//! Applies the engine's classifications back onto the ledger. Every path is
//! individually idempotent and retried on transient storage failure with
//! exponential backoff; exhaustion escalates instead of dropping the
//! classification.

use crate::domain::entities::trade::{
    CloseReason, TradeRecord, TradeSource, TradeStatus,
};
use crate::domain::errors::{ExecutorError, LedgerError};
use crate::domain::services::engine::Classification;
use crate::persistence::ledger::TradeLedger;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Strategy assigned to adopted positions until an operator claims them.
pub const UNASSIGNED_STRATEGY: &str = "UNASSIGNED";

/// What applying a classification did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// New record created for an orphan exchange position.
    Adopted { record_id: String },
    /// The orphan was already adopted in an earlier cycle.
    AlreadyAdopted { record_id: String },
    /// Ghost record transitioned to CLOSED_EXTERNALLY.
    GhostClosed { record_id: String },
    /// Non-canonical duplicates transitioned to DUPLICATE.
    DuplicatesClosed { record_ids: Vec<String> },
}

pub struct RecoveryActionExecutor {
    ledger: Arc<TradeLedger>,
    max_retries: u32,
    price_bucket_bp: u32,
}

impl RecoveryActionExecutor {
    pub fn new(ledger: Arc<TradeLedger>, max_retries: u32, price_bucket_bp: u32) -> Self {
        Self {
            ledger,
            max_retries,
            price_bucket_bp,
        }
    }

    /// Adoption idempotency key: same physical position, same key, across
    /// cycles and restarts. The bucket absorbs float noise in the entry
    /// price reported by the exchange.
    fn recovery_key(&self, symbol: &str, side: &str, entry_price: f64) -> String {
        let bucket = (entry_price * 10_000.0 / self.price_bucket_bp as f64).round() as i64;
        format!("{}:{}:{}", symbol, side, bucket)
    }

    /// Apply one classification to the ledger.
    pub async fn apply(&self, classification: &Classification) -> Result<ApplyOutcome, ExecutorError> {
        match classification {
            Classification::Orphan { position } => {
                let key = self.recovery_key(&position.symbol, position.side.as_str(), position.entry_price);

                if let Some(existing) = self
                    .with_retries("orphan-lookup", &key, || self.ledger.get_by_recovery_key(&key))
                    .await?
                {
                    return Ok(ApplyOutcome::AlreadyAdopted {
                        record_id: existing.id,
                    });
                }

                let now = Utc::now();
                let leverage = position.leverage.max(1);
                let record = TradeRecord {
                    id: format!("rec_{}_{}", position.symbol.to_lowercase(), now.timestamp_millis()),
                    strategy: UNASSIGNED_STRATEGY.to_string(),
                    symbol: position.symbol.clone(),
                    side: position.side,
                    entry_price: position.entry_price,
                    quantity: position.quantity,
                    margin: position.entry_price * position.quantity / leverage as f64,
                    leverage,
                    status: TradeStatus::OrphanRecovered,
                    opened_at: now,
                    closed_at: None,
                    updated_at: now,
                    exit_price: None,
                    realized_pnl: None,
                    exchange_position_ref: None,
                    unrealized_pnl: Some(position.unrealized_pnl),
                    source: TradeSource::Recovered,
                    recovery_key: Some(key.clone()),
                };

                self.with_retries("orphan-adoption", &key, || self.ledger.upsert(&record, false))
                    .await?;
                info!(
                    "Adopted orphan position {} {} qty {:.8} entry {:.8} as {}",
                    record.symbol, record.side, record.quantity, record.entry_price, record.id
                );
                Ok(ApplyOutcome::Adopted { record_id: record.id })
            }

            Classification::Ghost {
                record_id,
                symbol,
                side,
                estimated_exit,
            } => {
                let closed = self
                    .with_retries("ghost-close", record_id, || {
                        self.ledger
                            .mark_closed(record_id, *estimated_exit, CloseReason::ClosedExternally)
                    })
                    .await?;
                info!(
                    "Ghost {} ({} {}) closed externally at {:.8}, pnl {:.4}",
                    record_id,
                    symbol,
                    side,
                    estimated_exit,
                    closed.realized_pnl.unwrap_or(0.0)
                );
                Ok(ApplyOutcome::GhostClosed {
                    record_id: record_id.clone(),
                })
            }

            Classification::Duplicate {
                symbol,
                side,
                canonical_id,
                duplicate_ids,
            } => {
                let mut closed = Vec::with_capacity(duplicate_ids.len());
                for dup_id in duplicate_ids {
                    // Duplicates are bookkeeping artifacts, not real closes:
                    // settle them at their own entry price so no phantom PnL
                    // is recorded.
                    let record = self
                        .with_retries("duplicate-lookup", dup_id, || self.ledger.get_record(dup_id))
                        .await?
                        .ok_or_else(|| ExecutorError::Ledger(LedgerError::NotFound(dup_id.clone())))?;
                    self.with_retries("duplicate-close", dup_id, || {
                        self.ledger
                            .mark_closed(dup_id, record.entry_price, CloseReason::Duplicate)
                    })
                    .await?;
                    closed.push(dup_id.clone());
                }
                info!(
                    "Resolved duplicate {}/{}: canonical {}, closed {:?}",
                    symbol, side, canonical_id, closed
                );
                Ok(ApplyOutcome::DuplicatesClosed { record_ids: closed })
            }
        }
    }

    /// Retry a ledger operation on transient failures with exponential
    /// backoff and jitter; non-transient errors surface immediately, and
    /// exhaustion escalates as `PersistExhausted`.
    async fn with_retries<T, F, Fut>(
        &self,
        action: &'static str,
        subject: &str,
        mut op: F,
    ) -> Result<T, ExecutorError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LedgerError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(ExecutorError::Ledger(e)),
                Err(e) if attempt >= self.max_retries => {
                    error!(
                        "ALERT: {} for {} failed after {} attempts: {}",
                        action, subject, attempt, e
                    );
                    return Err(ExecutorError::PersistExhausted {
                        action,
                        subject: subject.to_string(),
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let base = 100u64 * 2u64.pow(attempt - 1);
                    let jitter = rand::thread_rng().gen_range(0..50);
                    warn!(
                        "{} for {} failed (attempt {}/{}): {}, retrying in {}ms",
                        action,
                        subject,
                        attempt,
                        self.max_retries,
                        e,
                        base + jitter
                    );
                    tokio::time::sleep(Duration::from_millis(base + jitter)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::exchange_position::ExchangePosition;
    use crate::domain::entities::trade::TradeSide;
    use crate::persistence::init_database;

    async fn setup() -> (Arc<TradeLedger>, RecoveryActionExecutor) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let ledger = Arc::new(TradeLedger::new(pool, 1_000, 86_400));
        let executor = RecoveryActionExecutor::new(ledger.clone(), 3, 50);
        (ledger, executor)
    }

    fn orphan(symbol: &str, quantity: f64, entry: f64) -> Classification {
        Classification::Orphan {
            position: ExchangePosition {
                symbol: symbol.to_string(),
                side: TradeSide::Long,
                quantity,
                entry_price: entry,
                unrealized_pnl: 0.25,
                leverage: 5,
            },
        }
    }

    fn open_record(id: &str, strategy: &str, symbol: &str) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: id.to_string(),
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            side: TradeSide::Long,
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

    #[tokio::test]
    async fn orphan_adoption_creates_recovered_record() {
        let (ledger, executor) = setup().await;

        let outcome = executor.apply(&orphan("XRPUSDT", 100.0, 0.50)).await.unwrap();
        let record_id = match outcome {
            ApplyOutcome::Adopted { record_id } => record_id,
            other => panic!("expected adoption, got {:?}", other),
        };

        let record = ledger.get_record(&record_id).await.unwrap().unwrap();
        assert_eq!(record.status, TradeStatus::OrphanRecovered);
        assert_eq!(record.source, TradeSource::Recovered);
        assert_eq!(record.strategy, UNASSIGNED_STRATEGY);
        assert!((record.quantity - 100.0).abs() < 1e-9);
        assert!((record.entry_price - 0.50).abs() < 1e-9);
        assert!((record.margin - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn repeated_orphan_classification_adopts_once() {
        let (ledger, executor) = setup().await;
        let classification = orphan("XRPUSDT", 100.0, 0.50);

        let first = executor.apply(&classification).await.unwrap();
        let second = executor.apply(&classification).await.unwrap();

        let first_id = match first {
            ApplyOutcome::Adopted { record_id } => record_id,
            other => panic!("expected adoption, got {:?}", other),
        };
        match second {
            ApplyOutcome::AlreadyAdopted { record_id } => assert_eq!(record_id, first_id),
            other => panic!("expected already-adopted, got {:?}", other),
        }

        let live = ledger.get_open(Some(UNASSIGNED_STRATEGY), None).await.unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn entry_price_jitter_maps_to_same_recovery_key() {
        let (ledger, executor) = setup().await;

        executor.apply(&orphan("XRPUSDT", 100.0, 0.50)).await.unwrap();
        let outcome = executor.apply(&orphan("XRPUSDT", 100.0, 0.5001)).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::AlreadyAdopted { .. }));

        let live = ledger.get_open(None, None).await.unwrap();
        assert_eq!(live.len(), 1);
    }

    #[tokio::test]
    async fn ghost_close_sets_exit_and_pnl() {
        let (ledger, executor) = setup().await;
        ledger
            .upsert(&open_record("t-1", "rsi_oversold", "BTCUSDT"), false)
            .await
            .unwrap();

        let outcome = executor
            .apply(&Classification::Ghost {
                record_id: "t-1".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: TradeSide::Long,
                estimated_exit: 95.0,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::GhostClosed { .. }));

        let closed = ledger.get_record("t-1").await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::ClosedExternally);
        assert_eq!(closed.exit_price, Some(95.0));
        assert!((closed.realized_pnl.unwrap() + 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn duplicate_resolution_closes_only_non_canonical() {
        let (ledger, executor) = setup().await;
        ledger
            .upsert(&open_record("t-canonical", "rsi_oversold", "BTCUSDT"), false)
            .await
            .unwrap();
        // Duplicates slip in through mirror merges; supersede mirrors that.
        ledger
            .upsert(&open_record("t-dup", "rsi_oversold", "BTCUSDT"), true)
            .await
            .unwrap();

        let outcome = executor
            .apply(&Classification::Duplicate {
                symbol: "BTCUSDT".to_string(),
                side: TradeSide::Long,
                canonical_id: "t-canonical".to_string(),
                duplicate_ids: vec!["t-dup".to_string()],
            })
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::DuplicatesClosed {
                record_ids: vec!["t-dup".to_string()]
            }
        );

        let canonical = ledger.get_record("t-canonical").await.unwrap().unwrap();
        assert_eq!(canonical.status, TradeStatus::Open);
        let dup = ledger.get_record("t-dup").await.unwrap().unwrap();
        assert_eq!(dup.status, TradeStatus::Duplicate);
        assert!((dup.realized_pnl.unwrap()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reapplying_a_ghost_close_is_a_no_op() {
        let (ledger, executor) = setup().await;
        ledger
            .upsert(&open_record("t-1", "rsi_oversold", "BTCUSDT"), false)
            .await
            .unwrap();

        let ghost = Classification::Ghost {
            record_id: "t-1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Long,
            estimated_exit: 95.0,
        };
        executor.apply(&ghost).await.unwrap();
        executor.apply(&ghost).await.unwrap();

        let closed = ledger.get_record("t-1").await.unwrap().unwrap();
        assert_eq!(closed.exit_price, Some(95.0));
    }
}
