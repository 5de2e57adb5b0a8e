//! Read-only dashboard surface.
//!
//! Every endpoint serves the last successfully computed state plus a
//! staleness indicator and never acquires the ledger-mutation lock, so a
//! failing reconciliation cycle cannot block a dashboard read.

use crate::application::reconciler::ReconciliationStatus;
use crate::domain::entities::sync_state::SyncState;
use crate::domain::entities::trade::TradeRecord;
use crate::persistence::ledger::TradeLedger;
use crate::persistence::reconciliation_audit::{AuditEntry, ReconciliationAuditRepository};
use crate::persistence::sync_state::SyncStateRepository;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct ApiState {
    pub ledger: Arc<TradeLedger>,
    pub audit: Arc<ReconciliationAuditRepository>,
    pub sync_states: Arc<SyncStateRepository>,
    pub recon_status: Arc<RwLock<ReconciliationStatus>>,
    pub environment: String,
    pub cycle_interval_secs: u64,
    pub sync_interval_secs: u64,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trades/open", get(open_trades))
        .route("/sync/status", get(sync_status))
        .route("/reconciliation/status", get(reconciliation_status))
        .route("/reconciliation/history", get(reconciliation_history))
        .with_state(state)
}

fn internal_error(e: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    environment: String,
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        environment: state.environment.clone(),
    })
}

#[derive(Serialize)]
struct OpenTradesResponse {
    trades: Vec<TradeRecord>,
    stale: bool,
    last_success_at: Option<DateTime<Utc>>,
}

async fn open_trades(State(state): State<ApiState>) -> Response {
    let trades = match state.ledger.get_open(None, None).await {
        Ok(trades) => trades,
        Err(e) => return internal_error(e),
    };

    let status = state.recon_status.read().await;
    Json(OpenTradesResponse {
        trades,
        stale: is_stale(status.last_success_at, state.cycle_interval_secs),
        last_success_at: status.last_success_at,
    })
    .into_response()
}

#[derive(Serialize)]
struct SyncStatusResponse {
    environment: String,
    last_sync_time: Option<DateTime<Utc>>,
    local_hash: Option<String>,
    remote_hash: Option<String>,
    should_sync: bool,
    stale: bool,
}

async fn sync_status(State(state): State<ApiState>) -> Response {
    let sync_state = match state.sync_states.load(&state.environment).await {
        Ok(Some(loaded)) => loaded,
        Ok(None) => SyncState::new(state.environment.clone(), state.sync_interval_secs),
        Err(e) => return internal_error(e),
    };

    let now = Utc::now();
    Json(SyncStatusResponse {
        should_sync: sync_state.should_sync(now),
        stale: is_stale(sync_state.last_sync_time, state.sync_interval_secs),
        environment: sync_state.environment,
        last_sync_time: sync_state.last_sync_time,
        local_hash: sync_state.local_hash,
        remote_hash: sync_state.remote_hash,
    })
    .into_response()
}

#[derive(Serialize)]
struct ReconciliationStatusResponse {
    #[serde(flatten)]
    status: ReconciliationStatus,
    stale: bool,
}

async fn reconciliation_status(State(state): State<ApiState>) -> Json<ReconciliationStatusResponse> {
    let status = state.recon_status.read().await.clone();
    let stale = is_stale(status.last_success_at, state.cycle_interval_secs);
    Json(ReconciliationStatusResponse { status, stale })
}

#[derive(Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct HistoryResponse {
    entries: Vec<AuditEntry>,
}

async fn reconciliation_history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryParams>,
) -> Response {
    let limit = params.limit.unwrap_or(50).min(500);
    match state.audit.history(limit).await {
        Ok(entries) => Json(HistoryResponse { entries }).into_response(),
        Err(e) => internal_error(e),
    }
}

/// State older than two intervals is stale: one interval of slack absorbs
/// scheduling jitter without flagging a healthy loop.
fn is_stale(last: Option<DateTime<Utc>>, interval_secs: u64) -> bool {
    match last {
        None => true,
        Some(at) => (Utc::now() - at).num_seconds() > 2 * interval_secs as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_thresholds() {
        assert!(is_stale(None, 30));
        assert!(!is_stale(Some(Utc::now()), 30));
        assert!(is_stale(
            Some(Utc::now() - chrono::Duration::seconds(61)),
            30
        ));
        assert!(!is_stale(
            Some(Utc::now() - chrono::Duration::seconds(45)),
            30
        ));
    }
}
