//! Exchange Client Trait
//!
//! Common interface to the exchange capability the reconciliation engine
//! consumes. Request signing, transports, and order placement belong to the
//! concrete clients behind this trait; the engine only reads positions and
//! mark prices. The abstraction keeps the observer independent of any one
//! exchange and makes the whole engine testable with in-memory doubles.

use crate::domain::entities::exchange_position::ExchangePosition;
use crate::domain::errors::ObserverError;
use async_trait::async_trait;

/// Common result type for exchange reads.
pub type ExchangeResult<T> = Result<T, ObserverError>;

/// Read-only view of the exchange consumed by the reconciliation engine.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Name of the exchange, for logging.
    fn name(&self) -> &str;

    /// Fetch the live positions for the given symbols.
    ///
    /// An empty result for a symbol is a valid, meaningful answer ("no
    /// position"), not an error. Errors are reserved for transport-level
    /// failures.
    async fn get_open_positions(&self, symbols: &[String]) -> ExchangeResult<Vec<ExchangePosition>>;

    /// Current mark price for a symbol.
    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<f64>;
}
