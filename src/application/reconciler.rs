//! Reconciler service - drives one Observer -> Engine -> Executor cycle.
//!
//! Owns the engine state and the last-known mark price cache, persists an
//! audit row per classification outcome, and publishes a status snapshot
//! the dashboard reads without ever touching the mutation lock.

use crate::domain::entities::exchange_position::ExchangePosition;
use crate::domain::errors::{LedgerError, ObserverError};
use crate::domain::services::engine::{Classification, CycleReport, ReconciliationEngine};
use crate::domain::services::executor::{ApplyOutcome, RecoveryActionExecutor};
use crate::domain::services::observer::ExchangeStateObserver;
use crate::persistence::ledger::TradeLedger;
use crate::persistence::reconciliation_audit::{AuditEntry, ReconciliationAuditRepository};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Last-computed reconciliation state, served to the dashboard even while
/// cycles are failing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationStatus {
    pub cycle_seq: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub last_orphans: usize,
    pub last_ghosts: usize,
    pub last_duplicates: usize,
    pub escalations: u64,
}

/// Outcome of one driven cycle, for logging and tests.
#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub cycle_seq: u64,
    pub skipped: bool,
    pub classifications: usize,
    pub applied: usize,
    pub escalated: usize,
}

pub struct ReconcilerService {
    observer: ExchangeStateObserver,
    engine: Mutex<ReconciliationEngine>,
    executor: RecoveryActionExecutor,
    ledger: Arc<TradeLedger>,
    audit: ReconciliationAuditRepository,
    symbols: Vec<String>,
    marks: Mutex<HashMap<String, f64>>,
    status: Arc<RwLock<ReconciliationStatus>>,
}

impl ReconcilerService {
    pub fn new(
        observer: ExchangeStateObserver,
        engine: ReconciliationEngine,
        executor: RecoveryActionExecutor,
        ledger: Arc<TradeLedger>,
        audit: ReconciliationAuditRepository,
        symbols: Vec<String>,
    ) -> Self {
        Self {
            observer,
            engine: Mutex::new(engine),
            executor,
            ledger,
            audit,
            symbols,
            marks: Mutex::new(HashMap::new()),
            status: Arc::new(RwLock::new(ReconciliationStatus::default())),
        }
    }

    /// Shared status handle for the dashboard surface.
    pub fn status_handle(&self) -> Arc<RwLock<ReconciliationStatus>> {
        self.status.clone()
    }

    /// Run one reconciliation cycle. Storage errors propagate to the task
    /// runner; observer failures are absorbed into the engine's counter.
    pub async fn run_cycle(&self) -> Result<CycleSummary, LedgerError> {
        let snapshot = self.observer.snapshot(&self.symbols).await;

        if snapshot.is_ok() {
            self.refresh_marks().await;
        }

        let live = self.ledger.get_open(None, None).await?;
        let marks = self.marks.lock().await.clone();

        let report = {
            let mut engine = self.engine.lock().await;
            let snapshot_ref: Result<&[ExchangePosition], &ObserverError> = match &snapshot {
                Ok(positions) => Ok(positions.as_slice()),
                Err(e) => Err(e),
            };
            engine.evaluate(snapshot_ref, &live, &marks)
        };

        match report {
            CycleReport::Skipped {
                cycle_seq,
                consecutive_failures,
                degraded,
            } => {
                let newly_degraded = {
                    let mut status = self.status.write().await;
                    let newly = degraded && !status.degraded;
                    status.cycle_seq = cycle_seq;
                    status.last_cycle_at = Some(Utc::now());
                    status.consecutive_failures = consecutive_failures;
                    status.degraded = degraded;
                    newly
                };

                if newly_degraded {
                    warn!(
                        "Reconciliation degraded after {} consecutive observer failures",
                        consecutive_failures
                    );
                    self.audit_entry(
                        cycle_seq,
                        "DEGRADED",
                        None,
                        None,
                        None,
                        serde_json::json!({ "consecutive_failures": consecutive_failures }),
                        "degraded",
                    )
                    .await;
                }

                Ok(CycleSummary {
                    cycle_seq,
                    skipped: true,
                    classifications: 0,
                    applied: 0,
                    escalated: 0,
                })
            }

            CycleReport::Evaluated {
                cycle_seq,
                matched,
                classifications,
            } => {
                for view in &matched {
                    if let Err(e) = self
                        .ledger
                        .refresh_exchange_view(&view.record_id, &view.position_ref, view.unrealized_pnl)
                        .await
                    {
                        warn!("Failed to refresh view of {}: {}", view.record_id, e);
                    }
                }

                let mut applied = 0usize;
                let mut escalated = 0usize;
                let mut orphans = 0usize;
                let mut ghosts = 0usize;
                let mut duplicates = 0usize;

                for classification in &classifications {
                    match classification {
                        Classification::Orphan { .. } => orphans += 1,
                        Classification::Ghost { .. } => ghosts += 1,
                        Classification::Duplicate { .. } => duplicates += 1,
                    }

                    match self.executor.apply(classification).await {
                        Ok(outcome) => {
                            applied += 1;
                            self.audit_classification(cycle_seq, classification, &outcome)
                                .await;
                        }
                        Err(e) => {
                            escalated += 1;
                            error!(
                                "ALERT: failed to apply {} classification: {}",
                                classification.kind(),
                                e
                            );
                            self.audit_entry(
                                cycle_seq,
                                classification.kind(),
                                classification_symbol(classification),
                                classification_side(classification),
                                classification_record_id(classification),
                                serde_json::json!({ "error": e.to_string() }),
                                "escalated",
                            )
                            .await;
                        }
                    }
                }

                {
                    let mut status = self.status.write().await;
                    status.cycle_seq = cycle_seq;
                    let now = Utc::now();
                    status.last_cycle_at = Some(now);
                    status.last_success_at = Some(now);
                    status.consecutive_failures = 0;
                    status.degraded = false;
                    status.last_orphans = orphans;
                    status.last_ghosts = ghosts;
                    status.last_duplicates = duplicates;
                    status.escalations += escalated as u64;
                }

                if classifications.is_empty() {
                    debug!("Cycle {}: ledger and exchange agree", cycle_seq);
                } else {
                    info!(
                        "Cycle {}: {} classifications ({} orphans, {} ghosts, {} duplicates), {} applied, {} escalated",
                        cycle_seq,
                        classifications.len(),
                        orphans,
                        ghosts,
                        duplicates,
                        applied,
                        escalated
                    );
                }

                Ok(CycleSummary {
                    cycle_seq,
                    skipped: false,
                    classifications: classifications.len(),
                    applied,
                    escalated,
                })
            }
        }
    }

    /// Immediate out-of-schedule cycle, for operator tooling.
    pub async fn force_cycle(&self) -> Result<CycleSummary, LedgerError> {
        info!("Forced reconciliation cycle requested");
        self.run_cycle().await
    }

    /// Update the last-known mark price cache. Individual lookup failures
    /// keep the previous value; ghosts estimated from a stale mark beat
    /// ghosts estimated from nothing.
    async fn refresh_marks(&self) {
        let mut updates = Vec::with_capacity(self.symbols.len());
        for symbol in &self.symbols {
            match self.observer.mark_price(symbol).await {
                Ok(price) => updates.push((symbol.clone(), price)),
                Err(e) => debug!("Mark price lookup failed for {}: {}", symbol, e),
            }
        }
        if !updates.is_empty() {
            let mut marks = self.marks.lock().await;
            for (symbol, price) in updates {
                marks.insert(symbol, price);
            }
        }
    }

    async fn audit_classification(
        &self,
        cycle_seq: u64,
        classification: &Classification,
        outcome: &ApplyOutcome,
    ) {
        let (details, outcome_str) = match (classification, outcome) {
            (Classification::Orphan { position }, ApplyOutcome::Adopted { record_id }) => (
                serde_json::json!({
                    "quantity": position.quantity,
                    "entry_price": position.entry_price,
                    "leverage": position.leverage,
                    "record_id": record_id,
                }),
                "adopted",
            ),
            (Classification::Orphan { position }, ApplyOutcome::AlreadyAdopted { record_id }) => (
                serde_json::json!({
                    "quantity": position.quantity,
                    "entry_price": position.entry_price,
                    "record_id": record_id,
                }),
                "already-adopted",
            ),
            (Classification::Ghost { estimated_exit, .. }, _) => (
                serde_json::json!({ "estimated_exit": estimated_exit }),
                "closed-externally",
            ),
            (Classification::Duplicate { canonical_id, .. }, ApplyOutcome::DuplicatesClosed { record_ids }) => (
                serde_json::json!({ "canonical_id": canonical_id, "closed": record_ids }),
                "duplicates-closed",
            ),
            _ => (serde_json::json!({}), "applied"),
        };

        self.audit_entry(
            cycle_seq,
            classification.kind(),
            classification_symbol(classification),
            classification_side(classification),
            classification_record_id(classification),
            details,
            outcome_str,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit_entry(
        &self,
        cycle_seq: u64,
        kind: &str,
        symbol: Option<String>,
        side: Option<String>,
        record_id: Option<String>,
        details: serde_json::Value,
        outcome: &str,
    ) {
        let entry = AuditEntry {
            cycle_seq,
            observed_at: Utc::now(),
            kind: kind.to_string(),
            symbol,
            side,
            record_id,
            details,
            outcome: outcome.to_string(),
        };
        // History is best-effort: the classification is already applied.
        if let Err(e) = self.audit.record(&entry).await {
            warn!("Failed to persist audit entry for cycle {}: {}", cycle_seq, e);
        }
    }
}

fn classification_symbol(c: &Classification) -> Option<String> {
    match c {
        Classification::Orphan { position } => Some(position.symbol.clone()),
        Classification::Ghost { symbol, .. } => Some(symbol.clone()),
        Classification::Duplicate { symbol, .. } => Some(symbol.clone()),
    }
}

fn classification_side(c: &Classification) -> Option<String> {
    match c {
        Classification::Orphan { position } => Some(position.side.to_string()),
        Classification::Ghost { side, .. } => Some(side.to_string()),
        Classification::Duplicate { side, .. } => Some(side.to_string()),
    }
}

fn classification_record_id(c: &Classification) -> Option<String> {
    match c {
        Classification::Orphan { .. } => None,
        Classification::Ghost { record_id, .. } => Some(record_id.clone()),
        Classification::Duplicate { canonical_id, .. } => Some(canonical_id.clone()),
    }
}
