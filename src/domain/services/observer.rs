//! Exchange State Observer
//!
//! Wraps the exchange-client capability into normalized per-cycle
//! snapshots. Every call is throttled through the shared request budget and
//! bounded by a timeout; transient failures come back as typed
//! `ObserverError`s so the engine can suppress classification for the
//! cycle instead of acting on a partial view.

use crate::domain::entities::exchange_position::ExchangePosition;
use crate::domain::errors::ObserverError;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::rate_limit::RequestBudget;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ExchangeStateObserver {
    client: Arc<dyn ExchangeClient>,
    budget: RequestBudget,
    request_timeout: Duration,
    dust_threshold: f64,
}

impl ExchangeStateObserver {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        budget: RequestBudget,
        observer_timeout_ms: u64,
        dust_threshold: f64,
    ) -> Self {
        Self {
            client,
            budget,
            request_timeout: Duration::from_millis(observer_timeout_ms),
            dust_threshold,
        }
    }

    /// Gather the live positions for all symbols.
    ///
    /// Symbol queries run concurrently but each drains the shared budget.
    /// An empty result for a symbol is a valid snapshot ("no position");
    /// any transport failure fails the whole snapshot, because acting on a
    /// partial view would misclassify the missing symbols as ghosts.
    pub async fn snapshot(
        &self,
        symbols: &[String],
    ) -> Result<Vec<ExchangePosition>, ObserverError> {
        let fetches = symbols.iter().map(|symbol| self.fetch_symbol(symbol));
        let results = join_all(fetches).await;

        let mut positions = Vec::new();
        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(batch) => positions.extend(batch),
                Err(e) => {
                    warn!("Snapshot failed for {} on {}: {}", symbol, self.client.name(), e);
                    return Err(e);
                }
            }
        }

        let before = positions.len();
        positions.retain(|p| !p.is_dust(self.dust_threshold));
        if positions.len() < before {
            debug!("Filtered {} dust positions from snapshot", before - positions.len());
        }

        Ok(positions)
    }

    async fn fetch_symbol(&self, symbol: &str) -> Result<Vec<ExchangePosition>, ObserverError> {
        if self.budget.check().is_err() {
            return Err(ObserverError::RateLimited);
        }

        let symbols = [symbol.to_string()];
        match tokio::time::timeout(self.request_timeout, self.client.get_open_positions(&symbols))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ObserverError::Timeout(self.request_timeout.as_millis() as u64)),
        }
    }

    /// Current mark price for a symbol, throttled and bounded like any
    /// other exchange read.
    pub async fn mark_price(&self, symbol: &str) -> Result<f64, ObserverError> {
        if self.budget.check().is_err() {
            return Err(ObserverError::RateLimited);
        }

        match tokio::time::timeout(self.request_timeout, self.client.get_mark_price(symbol)).await {
            Ok(result) => result,
            Err(_) => Err(ObserverError::Timeout(self.request_timeout.as_millis() as u64)),
        }
    }
}
