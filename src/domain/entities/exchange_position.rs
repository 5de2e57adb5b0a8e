//! Exchange position snapshot entry.
//!
//! Ephemeral: fetched each cycle, never persisted beyond the current
//! snapshot.

use crate::domain::entities::trade::TradeSide;
use serde::{Deserialize, Serialize};

/// One live position as reported by the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

impl ExchangePosition {
    /// Positions below the dust threshold are settlement residue, not real
    /// exposure, and are dropped from snapshots.
    pub fn is_dust(&self, threshold: f64) -> bool {
        self.quantity.abs() < threshold
    }

    /// Matching key shared with ledger records.
    pub fn match_key(&self) -> (String, TradeSide) {
        (self.symbol.clone(), self.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dust_filtering() {
        let pos = ExchangePosition {
            symbol: "BTCUSDT".to_string(),
            side: TradeSide::Long,
            quantity: 0.0005,
            entry_price: 50_000.0,
            unrealized_pnl: 0.0,
            leverage: 10,
        };
        assert!(pos.is_dust(0.001));
        assert!(!pos.is_dust(0.0001));
    }
}
