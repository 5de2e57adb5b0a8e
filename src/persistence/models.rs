//! Database row models and their conversions to domain entities.

use crate::domain::entities::sync_state::SyncState;
use crate::domain::entities::trade::{TradeRecord, TradeSide, TradeSource, TradeStatus};
use crate::domain::errors::LedgerError;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// Raw trades row; enums live as TEXT in SQLite and are parsed on the way
/// out so corruption surfaces as an error instead of a default.
#[derive(Debug, Clone, FromRow)]
pub struct TradeRow {
    pub id: String,
    pub strategy: String,
    pub symbol: String,
    pub side: String,
    pub entry_price: f64,
    pub quantity: f64,
    pub margin: f64,
    pub leverage: i64,
    pub status: String,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub exchange_position_ref: Option<String>,
    pub unrealized_pnl: Option<f64>,
    pub source: String,
    pub recovery_key: Option<String>,
}

impl TryFrom<TradeRow> for TradeRecord {
    type Error = LedgerError;

    fn try_from(row: TradeRow) -> Result<Self, Self::Error> {
        let side = TradeSide::parse(&row.side).ok_or_else(|| LedgerError::Corrupt {
            id: row.id.clone(),
            reason: format!("unknown side '{}'", row.side),
        })?;
        let status = TradeStatus::parse(&row.status).ok_or_else(|| LedgerError::Corrupt {
            id: row.id.clone(),
            reason: format!("unknown status '{}'", row.status),
        })?;
        let source = TradeSource::parse(&row.source).ok_or_else(|| LedgerError::Corrupt {
            id: row.id.clone(),
            reason: format!("unknown source '{}'", row.source),
        })?;

        Ok(TradeRecord {
            id: row.id,
            strategy: row.strategy,
            symbol: row.symbol,
            side,
            entry_price: row.entry_price,
            quantity: row.quantity,
            margin: row.margin,
            leverage: row.leverage as u32,
            status,
            opened_at: row.opened_at,
            closed_at: row.closed_at,
            updated_at: row.updated_at,
            exit_price: row.exit_price,
            realized_pnl: row.realized_pnl,
            exchange_position_ref: row.exchange_position_ref,
            unrealized_pnl: row.unrealized_pnl,
            source,
            recovery_key: row.recovery_key,
        })
    }
}

/// Raw sync_state row.
#[derive(Debug, Clone, FromRow)]
pub struct SyncStateRow {
    pub environment: String,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub sync_interval_secs: i64,
}

impl From<SyncStateRow> for SyncState {
    fn from(row: SyncStateRow) -> Self {
        SyncState {
            environment: row.environment,
            last_sync_time: row.last_sync_time,
            local_hash: row.local_hash,
            remote_hash: row.remote_hash,
            sync_interval_secs: row.sync_interval_secs as u64,
        }
    }
}

/// Raw reconciliation_audit row.
#[derive(Debug, Clone, FromRow)]
pub struct AuditRow {
    pub id: i64,
    pub cycle_seq: i64,
    pub observed_at: DateTime<Utc>,
    pub kind: String,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub record_id: Option<String>,
    pub details: String,
    pub outcome: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> TradeRow {
        TradeRow {
            id: "t-1".to_string(),
            strategy: "macd_divergence".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: "LONG".to_string(),
            entry_price: 50_000.0,
            quantity: 0.1,
            margin: 500.0,
            leverage: 10,
            status: "OPEN".to_string(),
            opened_at: Utc::now(),
            closed_at: None,
            updated_at: Utc::now(),
            exit_price: None,
            realized_pnl: None,
            exchange_position_ref: None,
            unrealized_pnl: None,
            source: "STRATEGY".to_string(),
            recovery_key: None,
        }
    }

    #[test]
    fn row_converts_to_record() {
        let record = TradeRecord::try_from(row()).unwrap();
        assert_eq!(record.side, TradeSide::Long);
        assert_eq!(record.status, TradeStatus::Open);
        assert_eq!(record.source, TradeSource::Strategy);
    }

    #[test]
    fn unknown_status_is_corrupt() {
        let mut bad = row();
        bad.status = "LIMBO".to_string();
        let err = TradeRecord::try_from(bad).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));
    }
}
