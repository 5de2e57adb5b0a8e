//! Reconciliation Engine
//!
//! Pure classification over the two position views: the exchange snapshot
//! (set E) and the ledger's live records (set L). The engine tracks
//! per-candidate debounce streaks and never touches storage; applying its
//! decisions is the executor's job.

use crate::domain::entities::exchange_position::ExchangePosition;
use crate::domain::entities::trade::{TradeRecord, TradeSide};
use crate::domain::errors::ObserverError;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Matching key shared by exchange positions and ledger records.
pub type MatchKey = (String, TradeSide);

/// A divergence the executor must act on.
#[derive(Debug, Clone)]
pub enum Classification {
    /// Exchange position with no local record; strategy unknown.
    Orphan { position: ExchangePosition },
    /// Local live record with no exchange position; exit estimated from
    /// the last-known mark price.
    Ghost {
        record_id: String,
        symbol: String,
        side: TradeSide,
        estimated_exit: f64,
    },
    /// Two or more live records on one key; everything but the canonical
    /// record must be closed.
    Duplicate {
        symbol: String,
        side: TradeSide,
        canonical_id: String,
        duplicate_ids: Vec<String>,
    },
}

impl Classification {
    pub fn kind(&self) -> &'static str {
        match self {
            Classification::Orphan { .. } => "ORPHAN",
            Classification::Ghost { .. } => "GHOST",
            Classification::Duplicate { .. } => "DUPLICATE",
        }
    }
}

/// Matched-record refresh instruction: the record exists on both sides, so
/// its snapshot view gets updated.
#[derive(Debug, Clone)]
pub struct MatchedView {
    pub record_id: String,
    pub position_ref: String,
    pub unrealized_pnl: f64,
}

/// Outcome of one engine evaluation.
#[derive(Debug)]
pub enum CycleReport {
    /// Observer failed; classification suppressed for the cycle.
    Skipped {
        cycle_seq: u64,
        consecutive_failures: u32,
        degraded: bool,
    },
    /// Successful cycle with refresh instructions and classifications.
    Evaluated {
        cycle_seq: u64,
        matched: Vec<MatchedView>,
        classifications: Vec<Classification>,
    },
}

pub struct ReconciliationEngine {
    debounce_threshold: u32,
    degraded_threshold: u32,
    cycle_seq: u64,
    consecutive_failures: u32,
    orphan_streaks: HashMap<MatchKey, u32>,
    ghost_streaks: HashMap<String, u32>,
}

impl ReconciliationEngine {
    pub fn new(debounce_threshold: u32, degraded_threshold: u32) -> Self {
        Self {
            debounce_threshold,
            degraded_threshold,
            cycle_seq: 0,
            consecutive_failures: 0,
            orphan_streaks: HashMap::new(),
            ghost_streaks: HashMap::new(),
        }
    }

    pub fn cycle_seq(&self) -> u64 {
        self.cycle_seq
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.degraded_threshold
    }

    /// Run one cycle of classification.
    ///
    /// `marks` holds the last-known mark price per symbol; a ghost whose
    /// symbol never produced a mark falls back to the record's entry price.
    ///
    /// Debounce streaks advance only on successful cycles. A candidate that
    /// goes unmatched for one successful cycle resets to zero; an observer
    /// failure neither advances nor resets a streak, since nothing was
    /// observed.
    pub fn evaluate(
        &mut self,
        snapshot: Result<&[ExchangePosition], &ObserverError>,
        live_records: &[TradeRecord],
        marks: &HashMap<String, f64>,
    ) -> CycleReport {
        self.cycle_seq += 1;

        let positions = match snapshot {
            Ok(positions) => positions,
            Err(e) => {
                self.consecutive_failures += 1;
                let degraded = self.is_degraded();
                if degraded {
                    warn!(
                        "Cycle {}: observer failed {} consecutive times ({}), reconciliation degraded",
                        self.cycle_seq, self.consecutive_failures, e
                    );
                } else {
                    debug!(
                        "Cycle {}: observer failure ({}), skipping classification",
                        self.cycle_seq, e
                    );
                }
                return CycleReport::Skipped {
                    cycle_seq: self.cycle_seq,
                    consecutive_failures: self.consecutive_failures,
                    degraded,
                };
            }
        };

        if self.consecutive_failures > 0 {
            info!(
                "Cycle {}: observer recovered after {} failures",
                self.cycle_seq, self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;

        let exchange_by_key: HashMap<MatchKey, &ExchangePosition> =
            positions.iter().map(|p| (p.match_key(), p)).collect();

        let mut ledger_by_key: HashMap<MatchKey, Vec<&TradeRecord>> = HashMap::new();
        for record in live_records {
            ledger_by_key
                .entry((record.symbol.clone(), record.side))
                .or_default()
                .push(record);
        }

        let mut matched = Vec::new();
        let mut classifications = Vec::new();

        // Matched keys: refresh the snapshot view of every record involved.
        for (key, records) in &ledger_by_key {
            if let Some(position) = exchange_by_key.get(key) {
                let position_ref = format!("cycle-{}:{}:{}", self.cycle_seq, key.0, key.1);
                for record in records {
                    matched.push(MatchedView {
                        record_id: record.id.clone(),
                        position_ref: position_ref.clone(),
                        unrealized_pnl: position.unrealized_pnl,
                    });
                }
            }
        }

        // Orphan candidates: on the exchange, not in the ledger.
        let orphan_keys: HashSet<MatchKey> = exchange_by_key
            .keys()
            .filter(|key| !ledger_by_key.contains_key(*key))
            .cloned()
            .collect();
        self.orphan_streaks.retain(|key, _| orphan_keys.contains(key));
        for key in &orphan_keys {
            let streak = self.orphan_streaks.entry(key.clone()).or_insert(0);
            *streak += 1;
            debug!(
                "Cycle {}: orphan candidate {}/{} streak {}/{}",
                self.cycle_seq, key.0, key.1, streak, self.debounce_threshold
            );
            if *streak >= self.debounce_threshold {
                let position = exchange_by_key[key];
                warn!(
                    "Cycle {}: ORPHAN {} {} qty {:.8} entry {:.8}",
                    self.cycle_seq, key.0, key.1, position.quantity, position.entry_price
                );
                classifications.push(Classification::Orphan {
                    position: (*position).clone(),
                });
            }
        }

        // Ghost candidates: in the ledger, not on the exchange.
        let ghost_records: Vec<&TradeRecord> = live_records
            .iter()
            .filter(|record| {
                !exchange_by_key.contains_key(&(record.symbol.clone(), record.side))
            })
            .collect();
        let ghost_ids: HashSet<&str> = ghost_records.iter().map(|r| r.id.as_str()).collect();
        self.ghost_streaks.retain(|id, _| ghost_ids.contains(id.as_str()));
        for record in &ghost_records {
            let streak = self.ghost_streaks.entry(record.id.clone()).or_insert(0);
            *streak += 1;
            debug!(
                "Cycle {}: ghost candidate {} ({} {}) streak {}/{}",
                self.cycle_seq, record.id, record.symbol, record.side, streak, self.debounce_threshold
            );
            if *streak >= self.debounce_threshold {
                let estimated_exit = marks
                    .get(&record.symbol)
                    .copied()
                    .unwrap_or(record.entry_price);
                warn!(
                    "Cycle {}: GHOST {} ({} {}), estimated exit {:.8}",
                    self.cycle_seq, record.id, record.symbol, record.side, estimated_exit
                );
                classifications.push(Classification::Ghost {
                    record_id: record.id.clone(),
                    symbol: record.symbol.clone(),
                    side: record.side,
                    estimated_exit,
                });
            }
        }

        // Duplicate keys: the ledger invariant should prevent these, but
        // races and mirror merges can still produce them. No debounce; an
        // internal inconsistency has no snapshot jitter to tolerate.
        for (key, records) in &ledger_by_key {
            if records.len() > 1 {
                let mut sorted: Vec<&&TradeRecord> = records.iter().collect();
                sorted.sort_by(|a, b| a.opened_at.cmp(&b.opened_at).then(a.id.cmp(&b.id)));
                let canonical_id = sorted[0].id.clone();
                let duplicate_ids: Vec<String> =
                    sorted[1..].iter().map(|r| r.id.clone()).collect();
                warn!(
                    "Cycle {}: DUPLICATE {}/{}, canonical {}, {} duplicates",
                    self.cycle_seq,
                    key.0,
                    key.1,
                    canonical_id,
                    duplicate_ids.len()
                );
                classifications.push(Classification::Duplicate {
                    symbol: key.0.clone(),
                    side: key.1,
                    canonical_id,
                    duplicate_ids,
                });
            }
        }

        // Deterministic output order: orphans, ghosts, duplicates, each
        // sorted by symbol.
        classifications.sort_by(|a, b| {
            fn rank(c: &Classification) -> (u8, &str) {
                match c {
                    Classification::Orphan { position } => (0, position.symbol.as_str()),
                    Classification::Ghost { symbol, .. } => (1, symbol.as_str()),
                    Classification::Duplicate { symbol, .. } => (2, symbol.as_str()),
                }
            }
            rank(a).cmp(&rank(b))
        });
        matched.sort_by(|a, b| a.record_id.cmp(&b.record_id));

        CycleReport::Evaluated {
            cycle_seq: self.cycle_seq,
            matched,
            classifications,
        }
    }
}
