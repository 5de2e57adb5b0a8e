//! Trade record entity - the canonical unit of local truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeSide {
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Long => "LONG",
            TradeSide::Short => "SHORT",
        }
    }

    pub fn parse(s: &str) -> Option<TradeSide> {
        match s {
            "LONG" => Some(TradeSide::Long),
            "SHORT" => Some(TradeSide::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a trade record.
///
/// `Open` and `OrphanRecovered` are live; the rest are terminal. Records are
/// never deleted, only transitioned to a terminal status, so the ledger keeps
/// an auditable history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "ORPHAN_RECOVERED")]
    OrphanRecovered,
    #[serde(rename = "CLOSED_EXTERNALLY")]
    ClosedExternally,
    #[serde(rename = "DUPLICATE")]
    Duplicate,
}

impl TradeStatus {
    /// Live records participate in reconciliation matching and in the
    /// one-per-(symbol, strategy) invariant.
    pub fn is_live(&self) -> bool {
        matches!(self, TradeStatus::Open | TradeStatus::OrphanRecovered)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::OrphanRecovered => "ORPHAN_RECOVERED",
            TradeStatus::ClosedExternally => "CLOSED_EXTERNALLY",
            TradeStatus::Duplicate => "DUPLICATE",
        }
    }

    pub fn parse(s: &str) -> Option<TradeStatus> {
        match s {
            "OPEN" => Some(TradeStatus::Open),
            "CLOSED" => Some(TradeStatus::Closed),
            "ORPHAN_RECOVERED" => Some(TradeStatus::OrphanRecovered),
            "CLOSED_EXTERNALLY" => Some(TradeStatus::ClosedExternally),
            "DUPLICATE" => Some(TradeStatus::Duplicate),
            _ => None,
        }
    }
}

/// How the record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSource {
    #[serde(rename = "STRATEGY")]
    Strategy,
    #[serde(rename = "RECOVERED")]
    Recovered,
}

impl TradeSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSource::Strategy => "STRATEGY",
            TradeSource::Recovered => "RECOVERED",
        }
    }

    pub fn parse(s: &str) -> Option<TradeSource> {
        match s {
            "STRATEGY" => Some(TradeSource::Strategy),
            "RECOVERED" => Some(TradeSource::Recovered),
            _ => None,
        }
    }
}

/// Why a record was closed; maps onto the terminal status it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Normal close driven by the execution path.
    Filled,
    /// Position vanished from the exchange (ghost conversion).
    ClosedExternally,
    /// Lost a duplicate-resolution round.
    Duplicate,
}

impl CloseReason {
    pub fn terminal_status(&self) -> TradeStatus {
        match self {
            CloseReason::Filled => TradeStatus::Closed,
            CloseReason::ClosedExternally => TradeStatus::ClosedExternally,
            CloseReason::Duplicate => TradeStatus::Duplicate,
        }
    }
}

/// Canonical local record of a trade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub strategy: String,
    pub symbol: String,
    pub side: TradeSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub margin: f64,
    pub leverage: u32,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub exchange_position_ref: Option<String>,
    pub unrealized_pnl: Option<f64>,
    pub source: TradeSource,
    pub recovery_key: Option<String>,
}

impl TradeRecord {
    /// Estimate realized PnL in quote units for a close at `exit_price`.
    pub fn estimate_pnl(&self, exit_price: f64) -> f64 {
        match self.side {
            TradeSide::Long => (exit_price - self.entry_price) * self.quantity,
            TradeSide::Short => (self.entry_price - exit_price) * self.quantity,
        }
    }

    /// PnL as a percentage of the margin backing the position.
    pub fn estimate_pnl_percentage(&self, exit_price: f64) -> f64 {
        if self.margin > 0.0 {
            self.estimate_pnl(exit_price) / self.margin * 100.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(side: TradeSide) -> TradeRecord {
        TradeRecord {
            id: "t-1".to_string(),
            strategy: "rsi_oversold".to_string(),
            symbol: "XRPUSDT".to_string(),
            side,
            entry_price: 0.50,
            quantity: 100.0,
            margin: 10.0,
            leverage: 5,
            status: TradeStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
            updated_at: Utc::now(),
            exit_price: None,
            realized_pnl: None,
            exchange_position_ref: None,
            unrealized_pnl: None,
            source: TradeSource::Strategy,
            recovery_key: None,
        }
    }

    #[test]
    fn long_pnl_positive_when_price_rises() {
        let rec = record(TradeSide::Long);
        assert!((rec.estimate_pnl(0.55) - 5.0).abs() < 1e-9);
        assert!((rec.estimate_pnl_percentage(0.55) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn short_pnl_positive_when_price_falls() {
        let rec = record(TradeSide::Short);
        assert!((rec.estimate_pnl(0.45) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn live_statuses() {
        assert!(TradeStatus::Open.is_live());
        assert!(TradeStatus::OrphanRecovered.is_live());
        assert!(!TradeStatus::ClosedExternally.is_live());
        assert!(!TradeStatus::Duplicate.is_live());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            TradeStatus::Open,
            TradeStatus::Closed,
            TradeStatus::OrphanRecovered,
            TradeStatus::ClosedExternally,
            TradeStatus::Duplicate,
        ] {
            assert_eq!(TradeStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn close_reason_maps_to_terminal_status() {
        assert_eq!(
            CloseReason::ClosedExternally.terminal_status(),
            TradeStatus::ClosedExternally
        );
        assert_eq!(CloseReason::Duplicate.terminal_status(), TradeStatus::Duplicate);
    }
}
