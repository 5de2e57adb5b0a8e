//! Exchange request budget.
//!
//! A single token bucket shared by every exchange read the engine makes,
//! sized from the documented request budget in the configuration. Symbol
//! queries inside one cycle may run concurrently but all drain this bucket.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Shared request budget
pub type RequestBudget = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Create a token bucket allowing `requests_per_minute` exchange calls.
///
/// The zero case is rejected by config validation before this is reached.
pub fn create_request_budget(requests_per_minute: u32) -> RequestBudget {
    let quota = Quota::per_minute(
        NonZeroU32::new(requests_per_minute).expect("Requests per minute must be non-zero"),
    );
    Arc::new(RateLimiter::direct(quota))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_allows_requests_up_to_quota() {
        let budget = create_request_budget(10);
        for _ in 0..10 {
            assert!(budget.check().is_ok());
        }
        // Bucket is drained now
        assert!(budget.check().is_err());
    }
}
