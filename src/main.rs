mod api;
mod application;
mod config;
mod domain;
mod infrastructure;
mod persistence;
mod rate_limit;
mod sync;
mod task_runner;

use crate::application::reconciler::ReconcilerService;
use crate::domain::services::engine::ReconciliationEngine;
use crate::domain::services::executor::RecoveryActionExecutor;
use crate::domain::services::observer::ExchangeStateObserver;
use crate::infrastructure::gateway_client::GatewayExchangeClient;
use crate::infrastructure::http_mirror::HttpMirrorStore;
use crate::persistence::ledger::TradeLedger;
use crate::persistence::reconciliation_audit::ReconciliationAuditRepository;
use crate::persistence::sync_state::SyncStateRepository;
use crate::sync::{run_sync_tick, CloudMirrorSync};
use crate::task_runner::{run_periodic_with_circuit_breaker, CircuitBreakerConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mlinzi=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::ReconcilerConfig::from_env()?;
    info!(
        "Reconciliation engine starting: environment={}, {} symbols, cycle every {}s, K={}",
        config.environment,
        config.symbols.len(),
        config.cycle_interval_secs,
        config.debounce_threshold
    );

    let pool = persistence::init_database(&config.database_url).await?;
    let ledger = Arc::new(TradeLedger::new(
        pool.clone(),
        config.lock_wait_ms,
        config.hash_recent_window_secs,
    ));
    let audit = ReconciliationAuditRepository::new(pool.clone());

    let budget = rate_limit::create_request_budget(config.requests_per_minute);
    let exchange = Arc::new(GatewayExchangeClient::new(
        config.exchange_gateway_url.clone(),
        config.observer_timeout_ms,
    ));
    let observer = ExchangeStateObserver::new(
        exchange,
        budget,
        config.observer_timeout_ms,
        config.dust_threshold,
    );

    let engine = ReconciliationEngine::new(config.debounce_threshold, config.degraded_threshold);
    let executor = RecoveryActionExecutor::new(
        ledger.clone(),
        config.executor_max_retries,
        config.price_bucket_bp,
    );

    let reconciler = Arc::new(ReconcilerService::new(
        observer,
        engine,
        executor,
        ledger.clone(),
        audit,
        config.symbols.clone(),
    ));

    // Reconciliation cycle task
    let cycle_reconciler = reconciler.clone();
    let cycle_interval = Duration::from_secs(config.cycle_interval_secs);
    tokio::spawn(async move {
        run_periodic_with_circuit_breaker(
            "reconciliation-cycle",
            cycle_interval,
            CircuitBreakerConfig::default(),
            || {
                let reconciler = cycle_reconciler.clone();
                async move {
                    reconciler
                        .run_cycle()
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            },
        )
        .await;
    });

    // Cloud mirror sync task, on its own schedule
    match &config.mirror_url {
        Some(mirror_url) => {
            let store = Arc::new(HttpMirrorStore::new(
                mirror_url.clone(),
                config.environment.clone(),
                config.observer_timeout_ms,
            ));
            let mut mirror_sync = CloudMirrorSync::new(
                ledger.clone(),
                SyncStateRepository::new(pool.clone()),
                store,
                config.environment.clone(),
                config.sync_interval_secs,
            );
            let sync_interval = Duration::from_secs(config.sync_interval_secs);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sync_interval);
                loop {
                    ticker.tick().await;
                    run_sync_tick(&mut mirror_sync).await;
                }
            });
        }
        None => {
            warn!("MIRROR_URL not configured, cloud sync disabled");
        }
    }

    // Daily retention sweep for old terminal records
    let retention_ledger = ledger.clone();
    let retention_days = config.retention_days;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(86_400));
        loop {
            ticker.tick().await;
            if let Err(e) = retention_ledger.purge_terminal_older_than(retention_days).await {
                warn!("Retention sweep failed: {}", e);
            }
        }
    });

    // Read-only dashboard surface
    let api_state = api::ApiState {
        ledger: ledger.clone(),
        audit: Arc::new(ReconciliationAuditRepository::new(pool.clone())),
        sync_states: Arc::new(SyncStateRepository::new(pool)),
        recon_status: reconciler.status_handle(),
        environment: config.environment.clone(),
        cycle_interval_secs: config.cycle_interval_secs,
        sync_interval_secs: config.sync_interval_secs,
    };
    let app = api::router(api_state);

    info!("Dashboard surface listening on {}", config.api_addr);
    let listener = tokio::net::TcpListener::bind(config.api_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
