//! Persistence Layer
//!
//! SQLite storage for the trade ledger, sync state, and reconciliation
//! audit trail, with async access via sqlx. One database file per
//! deployment environment; sandbox and production never share a handle.
//!
//! # Schema
//!
//! ## trades
//! Canonical trade records. Records are never deleted while live; terminal
//! rows are kept for audit and only purged by the retention sweep.
//!
//! ## sync_state
//! One row per environment: last sync time plus the local/remote content
//! hashes the mirror sync compares.
//!
//! ## reconciliation_audit
//! One row per classification outcome, queried by the dashboard history
//! endpoint.

pub mod ledger;
pub mod models;
pub mod reconciliation_audit;
pub mod sync_state;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),
}

/// Initialize the database connection pool and run migrations.
///
/// # Arguments
/// - `database_url`: Path to SQLite database file (e.g., "sqlite://data/mlinzi.db")
pub async fn init_database(database_url: &str) -> Result<DbPool, DatabaseError> {
    info!("Initializing database: {}", database_url);

    // Ensure data directory exists
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            strategy TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL CHECK(side IN ('LONG', 'SHORT')),
            entry_price REAL NOT NULL,
            quantity REAL NOT NULL,
            margin REAL NOT NULL,
            leverage INTEGER NOT NULL,
            status TEXT NOT NULL CHECK(status IN (
                'OPEN', 'CLOSED', 'ORPHAN_RECOVERED', 'CLOSED_EXTERNALLY', 'DUPLICATE'
            )),
            opened_at DATETIME NOT NULL,
            closed_at DATETIME,
            updated_at DATETIME NOT NULL,
            exit_price REAL,
            realized_pnl REAL,
            exchange_position_ref TEXT,
            unrealized_pnl REAL,
            source TEXT NOT NULL CHECK(source IN ('STRATEGY', 'RECOVERED')),
            recovery_key TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create trades table: {}", e)))?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            environment TEXT PRIMARY KEY,
            last_sync_time DATETIME,
            local_hash TEXT,
            remote_hash TEXT,
            sync_interval_secs INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create sync_state table: {}", e))
    })?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            cycle_seq INTEGER NOT NULL,
            observed_at DATETIME NOT NULL,
            kind TEXT NOT NULL,
            symbol TEXT,
            side TEXT,
            record_id TEXT,
            details TEXT NOT NULL,
            outcome TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!(
            "Failed to create reconciliation_audit table: {}",
            e
        ))
    })?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_symbol ON trades(symbol)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_updated_at ON trades(updated_at)")
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    // Adoption idempotency: at most one record per recovery key.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_trades_recovery_key \
         ON trades(recovery_key) WHERE recovery_key IS NOT NULL",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_observed_at ON reconciliation_audit(observed_at)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    info!("Database migrations completed");

    Ok(())
}
