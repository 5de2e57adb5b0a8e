/// Periodic task runner with circuit breaker.
///
/// Drives a task on a fixed interval with automatic retry, exponential
/// backoff between failed iterations, and failure tracking so background
/// loops cannot degrade silently in production.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// Circuit breaker configuration for background tasks
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Maximum number of consecutive failures before panic
    pub max_consecutive_failures: u32,
    /// Initial delay between retries
    pub initial_retry_delay: Duration,
    /// Maximum delay between retries
    pub max_retry_delay: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(60),
        }
    }
}

/// Internal state for circuit breaker
#[derive(Debug)]
struct CircuitBreakerState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl CircuitBreakerState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    fn record_failure(&mut self, max_delay: Duration) {
        self.consecutive_failures += 1;
        // Exponential backoff with cap
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run a periodic background task with circuit breaker protection.
///
/// One iteration runs every `interval`; a failed iteration retries after
/// the current backoff delay instead. If the task fails too many times
/// consecutively the function panics so the supervisor notices, rather
/// than letting a critical loop rot silently.
///
/// # Panics
/// Panics after `max_consecutive_failures` consecutive failures.
pub async fn run_periodic_with_circuit_breaker<F, Fut>(
    task_name: &str,
    interval: Duration,
    config: CircuitBreakerConfig,
    mut task_fn: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut state = CircuitBreakerState::new(config.initial_retry_delay);

    loop {
        match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failures",
                        task_name, state.consecutive_failures
                    );
                }
                state.reset(config.initial_retry_delay);
                sleep(interval).await;
            }
            Err(e) => {
                state.record_failure(config.max_retry_delay);
                error!(
                    "Task '{}' failed (attempt {}/{}): {}",
                    task_name, state.consecutive_failures, config.max_consecutive_failures, e
                );

                if state.consecutive_failures >= config.max_consecutive_failures {
                    panic!(
                        "FATAL: Task '{}' exceeded maximum consecutive failures ({}). \
                         Last error: {}. System cannot continue with failed critical task.",
                        task_name, config.max_consecutive_failures, e
                    );
                }

                warn!(
                    "Task '{}' will retry in {:?}",
                    task_name, state.current_retry_delay
                );
                sleep(state.current_retry_delay).await;
            }
        }
    }
}
