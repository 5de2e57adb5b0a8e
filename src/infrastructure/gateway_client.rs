//! Exchange gateway client.
//!
//! Read-only HTTP client for the exchange-gateway capability that fronts
//! the actual exchange. Signing, order placement, and rate-limit headers
//! live in the gateway; this client only reads positions and mark prices:
//!
//! - `GET {base}/positions?symbols=BTCUSDT,ETHUSDT`
//! - `GET {base}/mark-price/{symbol}`

use crate::domain::entities::exchange_position::ExchangePosition;
use crate::domain::errors::ObserverError;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize)]
struct MarkPriceResponse {
    price: f64,
}

pub struct GatewayExchangeClient {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayExchangeClient {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn map_send_error(e: reqwest::Error) -> ObserverError {
        if e.is_timeout() {
            ObserverError::Timeout(0)
        } else {
            ObserverError::Connectivity(e.to_string())
        }
    }
}

#[async_trait]
impl ExchangeClient for GatewayExchangeClient {
    fn name(&self) -> &str {
        "exchange-gateway"
    }

    async fn get_open_positions(&self, symbols: &[String]) -> ExchangeResult<Vec<ExchangePosition>> {
        let url = format!("{}/positions?symbols={}", self.base_url, symbols.join(","));
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ObserverError::Http {
                status: status.as_u16(),
            });
        }

        response
            .json::<Vec<ExchangePosition>>()
            .await
            .map_err(|e| ObserverError::Connectivity(e.to_string()))
    }

    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<f64> {
        let url = format!("{}/mark-price/{}", self.base_url, symbol);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ObserverError::Http {
                status: status.as_u16(),
            });
        }

        let body = response
            .json::<MarkPriceResponse>()
            .await
            .map_err(|e| ObserverError::Connectivity(e.to_string()))?;
        Ok(body.price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let client = GatewayExchangeClient::new("http://gateway:8080/", 5_000);
        assert_eq!(client.base_url, "http://gateway:8080");
    }
}
