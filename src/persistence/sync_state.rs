//! Sync state repository.
//!
//! One row per deployment environment. Sandbox and production carry their
//! own rows (and normally their own database files) and never
//! cross-reconcile.

use crate::domain::entities::sync_state::SyncState;
use crate::domain::errors::LedgerError;
use crate::persistence::models::SyncStateRow;
use crate::persistence::DbPool;
use tracing::debug;

pub struct SyncStateRepository {
    pool: DbPool,
}

impl SyncStateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Load the state for an environment; `None` before the first sync.
    pub async fn load(&self, environment: &str) -> Result<Option<SyncState>, LedgerError> {
        let row: Option<SyncStateRow> =
            sqlx::query_as("SELECT * FROM sync_state WHERE environment = ?1")
                .bind(environment)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(SyncState::from))
    }

    /// Persist the state, replacing any previous row for the environment.
    pub async fn save(&self, state: &SyncState) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (
                environment, last_sync_time, local_hash, remote_hash, sync_interval_secs
            )
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(environment) DO UPDATE SET
                last_sync_time = excluded.last_sync_time,
                local_hash = excluded.local_hash,
                remote_hash = excluded.remote_hash,
                sync_interval_secs = excluded.sync_interval_secs
            "#,
        )
        .bind(&state.environment)
        .bind(state.last_sync_time)
        .bind(&state.local_hash)
        .bind(&state.remote_hash)
        .bind(state.sync_interval_secs as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved sync state for {}", state.environment);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;
    use chrono::Utc;

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let repo = SyncStateRepository::new(pool);

        assert!(repo.load("sandbox").await.unwrap().is_none());

        let mut state = SyncState::new("sandbox", 30);
        state.local_hash = Some("abc".to_string());
        state.remote_hash = Some("abc".to_string());
        state.last_sync_time = Some(Utc::now());
        repo.save(&state).await.unwrap();

        let loaded = repo.load("sandbox").await.unwrap().unwrap();
        assert_eq!(loaded.local_hash.as_deref(), Some("abc"));
        assert_eq!(loaded.sync_interval_secs, 30);

        // environments are isolated rows
        assert!(repo.load("production").await.unwrap().is_none());
    }
}
