//! Typed configuration for the reconciliation engine.
//!
//! Every tunable is an explicit, validated field passed into component
//! constructors. Components never read the process environment themselves;
//! `from_env` is the single place environment variables are folded in, and
//! `validate` rejects zero or empty values at load time instead of at use
//! time.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: &'static str },
}

/// Configuration surface of the reconciliation engine.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Deployment environment tag; sandbox and production never share
    /// storage or mirrors.
    pub environment: String,
    /// Symbols watched each cycle.
    pub symbols: Vec<String>,
    /// Seconds between reconciliation cycles.
    pub cycle_interval_secs: u64,
    /// Consecutive confirming cycles before acting on a divergence (K).
    pub debounce_threshold: u32,
    /// Consecutive observer failures before the degraded flag is raised.
    pub degraded_threshold: u32,
    /// Seconds between mirror sync rounds.
    pub sync_interval_secs: u64,
    /// Timeout for a single exchange request, milliseconds.
    pub observer_timeout_ms: u64,
    /// Exchange request budget per minute (token bucket size).
    pub requests_per_minute: u32,
    /// Bounded wait for the ledger-mutation lock, milliseconds.
    pub lock_wait_ms: u64,
    /// Attempts before an executor persist failure escalates.
    pub executor_max_retries: u32,
    /// Width of the adoption idempotency price bucket, basis points.
    pub price_bucket_bp: u32,
    /// Terminal records stay in the content hash for this many seconds.
    pub hash_recent_window_secs: u64,
    /// Terminal records older than this many days may be purged.
    pub retention_days: u32,
    /// Snapshot entries below this quantity are settlement dust.
    pub dust_threshold: f64,
    /// Base url of the exchange-gateway capability serving position and
    /// mark-price reads.
    pub exchange_gateway_url: String,
    /// SQLite database url, one per environment.
    pub database_url: String,
    /// Mirror endpoint; `None` disables cloud sync.
    pub mirror_url: Option<String>,
    /// Dashboard read-surface listen address.
    pub api_addr: SocketAddr,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            environment: "sandbox".to_string(),
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "SOLUSDT".to_string(),
                "XRPUSDT".to_string(),
            ],
            cycle_interval_secs: 30,
            debounce_threshold: 2,
            degraded_threshold: 3,
            sync_interval_secs: 30,
            observer_timeout_ms: 10_000,
            requests_per_minute: 120,
            lock_wait_ms: 5_000,
            executor_max_retries: 3,
            price_bucket_bp: 50,
            hash_recent_window_secs: 86_400,
            retention_days: 30,
            dust_threshold: 0.001,
            exchange_gateway_url: "http://127.0.0.1:8080".to_string(),
            database_url: "sqlite://data/mlinzi.db".to_string(),
            mirror_url: None,
            api_addr: ([127, 0, 0, 1], 3000).into(),
        }
    }
}

impl ReconcilerConfig {
    /// Build from environment variables on top of the documented defaults.
    ///
    /// Unparseable or out-of-range values keep the default and log a
    /// warning; structural problems (empty symbol list, zero intervals)
    /// fail validation afterwards.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ReconcilerConfig::default();

        if let Ok(env) = std::env::var("RECONCILER_ENVIRONMENT") {
            if !env.trim().is_empty() {
                config.environment = env;
            }
        }

        if let Ok(symbols) = std::env::var("RECONCILER_SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.symbols = parsed;
            }
        }

        Self::env_u64("RECONCILER_CYCLE_INTERVAL_SECS", 5..=3600, &mut config.cycle_interval_secs);
        Self::env_u32("RECONCILER_DEBOUNCE_THRESHOLD", 1..=10, &mut config.debounce_threshold);
        Self::env_u32("RECONCILER_DEGRADED_THRESHOLD", 1..=20, &mut config.degraded_threshold);
        Self::env_u64("RECONCILER_SYNC_INTERVAL_SECS", 5..=3600, &mut config.sync_interval_secs);
        Self::env_u64("RECONCILER_OBSERVER_TIMEOUT_MS", 1000..=60_000, &mut config.observer_timeout_ms);
        Self::env_u32("RECONCILER_REQUESTS_PER_MINUTE", 1..=6000, &mut config.requests_per_minute);
        Self::env_u64("RECONCILER_LOCK_WAIT_MS", 100..=60_000, &mut config.lock_wait_ms);
        Self::env_u32("RECONCILER_EXECUTOR_MAX_RETRIES", 1..=10, &mut config.executor_max_retries);
        Self::env_u32("RECONCILER_PRICE_BUCKET_BP", 1..=1000, &mut config.price_bucket_bp);
        Self::env_u64("RECONCILER_HASH_WINDOW_SECS", 60..=604_800, &mut config.hash_recent_window_secs);
        Self::env_u32("RECONCILER_RETENTION_DAYS", 1..=365, &mut config.retention_days);

        if let Ok(url) = std::env::var("EXCHANGE_GATEWAY_URL") {
            if !url.trim().is_empty() {
                config.exchange_gateway_url = url;
            }
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.trim().is_empty() {
                config.database_url = url;
            }
        }

        if let Ok(url) = std::env::var("MIRROR_URL") {
            if !url.trim().is_empty() {
                config.mirror_url = Some(url);
            }
        }

        if let Ok(addr) = std::env::var("RECONCILER_API_ADDR") {
            match addr.parse() {
                Ok(parsed) => config.api_addr = parsed,
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse RECONCILER_API_ADDR '{}': {}, using default {}",
                        addr,
                        e,
                        config.api_addr
                    );
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn env_u64(name: &'static str, range: std::ops::RangeInclusive<u64>, slot: &mut u64) {
        if let Ok(raw) = std::env::var(name) {
            match raw.parse::<u64>() {
                Ok(value) if range.contains(&value) => *slot = value,
                Ok(value) => {
                    tracing::warn!(
                        "{} value {} outside {:?}, using default {}",
                        name,
                        value,
                        range,
                        slot
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {} '{}': {}, using default {}", name, raw, e, slot);
                }
            }
        }
    }

    fn env_u32(name: &'static str, range: std::ops::RangeInclusive<u32>, slot: &mut u32) {
        if let Ok(raw) = std::env::var(name) {
            match raw.parse::<u32>() {
                Ok(value) if range.contains(&value) => *slot = value,
                Ok(value) => {
                    tracing::warn!(
                        "{} value {} outside {:?}, using default {}",
                        name,
                        value,
                        range,
                        slot
                    );
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {} '{}': {}, using default {}", name, raw, e, slot);
                }
            }
        }
    }

    /// Reject structurally invalid configurations at load time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "environment", reason: "must not be empty" });
        }
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid { field: "symbols", reason: "must list at least one symbol" });
        }
        if self.cycle_interval_secs == 0 {
            return Err(ConfigError::Invalid { field: "cycle_interval_secs", reason: "must be non-zero" });
        }
        if self.debounce_threshold == 0 {
            return Err(ConfigError::Invalid { field: "debounce_threshold", reason: "must be at least 1" });
        }
        if self.degraded_threshold == 0 {
            return Err(ConfigError::Invalid { field: "degraded_threshold", reason: "must be at least 1" });
        }
        if self.sync_interval_secs == 0 {
            return Err(ConfigError::Invalid { field: "sync_interval_secs", reason: "must be non-zero" });
        }
        if self.observer_timeout_ms == 0 {
            return Err(ConfigError::Invalid { field: "observer_timeout_ms", reason: "must be non-zero" });
        }
        if self.requests_per_minute == 0 {
            return Err(ConfigError::Invalid { field: "requests_per_minute", reason: "must be non-zero" });
        }
        if self.lock_wait_ms == 0 {
            return Err(ConfigError::Invalid { field: "lock_wait_ms", reason: "must be non-zero" });
        }
        if self.executor_max_retries == 0 {
            return Err(ConfigError::Invalid { field: "executor_max_retries", reason: "must be at least 1" });
        }
        if self.price_bucket_bp == 0 {
            return Err(ConfigError::Invalid { field: "price_bucket_bp", reason: "must be non-zero" });
        }
        if self.exchange_gateway_url.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "exchange_gateway_url", reason: "must not be empty" });
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid { field: "database_url", reason: "must not be empty" });
        }
        if !(self.dust_threshold > 0.0) {
            return Err(ConfigError::Invalid { field: "dust_threshold", reason: "must be positive" });
        }
        Ok(())
    }
}
