//! Reconciliation Audit Repository
//!
//! Persists one row per classification outcome so operators can answer
//! "what did the engine decide, and when" from the dashboard long after
//! the cycle ran.

use crate::domain::errors::LedgerError;
use crate::persistence::models::AuditRow;
use crate::persistence::DbPool;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

/// One audited classification outcome.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub cycle_seq: u64,
    pub observed_at: DateTime<Utc>,
    pub kind: String,
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub record_id: Option<String>,
    pub details: serde_json::Value,
    pub outcome: String,
}

pub struct ReconciliationAuditRepository {
    pool: DbPool,
}

impl ReconciliationAuditRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, entry: &AuditEntry) -> Result<(), LedgerError> {
        let details = serde_json::to_string(&entry.details)?;
        sqlx::query(
            r#"
            INSERT INTO reconciliation_audit (
                cycle_seq, observed_at, kind, symbol, side, record_id, details, outcome
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(entry.cycle_seq as i64)
        .bind(entry.observed_at)
        .bind(&entry.kind)
        .bind(&entry.symbol)
        .bind(&entry.side)
        .bind(&entry.record_id)
        .bind(details)
        .bind(&entry.outcome)
        .execute(&self.pool)
        .await?;

        debug!("Audited {} for cycle {}", entry.kind, entry.cycle_seq);
        Ok(())
    }

    /// Most recent entries, newest first.
    pub async fn history(&self, limit: u32) -> Result<Vec<AuditEntry>, LedgerError> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT * FROM reconciliation_audit ORDER BY observed_at DESC, id DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let details = serde_json::from_str(&row.details)?;
                Ok(AuditEntry {
                    cycle_seq: row.cycle_seq as u64,
                    observed_at: row.observed_at,
                    kind: row.kind,
                    symbol: row.symbol,
                    side: row.side,
                    record_id: row.record_id,
                    details,
                    outcome: row.outcome,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    #[tokio::test]
    async fn record_and_history() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = ReconciliationAuditRepository::new(pool);

        for seq in 1..=3u64 {
            repo.record(&AuditEntry {
                cycle_seq: seq,
                observed_at: Utc::now(),
                kind: "ORPHAN".to_string(),
                symbol: Some("XRPUSDT".to_string()),
                side: Some("LONG".to_string()),
                record_id: None,
                details: serde_json::json!({ "quantity": 100.0 }),
                outcome: "adopted".to_string(),
            })
            .await
            .unwrap();
        }

        let history = repo.history(2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].cycle_seq, 3);
        assert_eq!(history[0].details["quantity"], 100.0);
    }
}
