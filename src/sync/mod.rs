//! Cloud Mirror Sync Manager
//!
//! Keeps the remote mirror eventually consistent with the local ledger via
//! content-hash comparison. The design favors local availability over
//! cross-instance consistency: a failed round logs, backs off, and leaves
//! trading and reconciliation running on the local ledger.
//!
//! State machine per environment: `Idle -> Syncing -> Idle`, with `Failed`
//! as a non-terminal retry state driving exponential backoff.

use crate::domain::entities::sync_state::SyncState;
use crate::domain::errors::SyncError;
use crate::domain::repositories::mirror_store::{MirrorManifest, MirrorStore};
use crate::persistence::ledger::TradeLedger;
use crate::persistence::sync_state::SyncStateRepository;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where the manager sits between rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    Failed,
}

/// What one trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Interval not elapsed and hashes converged.
    NotDue,
    /// A previous failure's backoff window is still open.
    BackingOff,
    /// Hashes already matched; only `last_sync_time` was touched.
    NoOp,
    /// Full round: pulled, merged, pushed.
    Synced { accepted: usize, pushed: usize },
}

/// Exponential backoff schedule between failed rounds.
#[derive(Debug, Clone)]
pub struct SyncRetryPolicy {
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for SyncRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_secs: 5,
            max_delay_secs: 300,
        }
    }
}

impl SyncRetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let delay = self
            .initial_delay_secs
            .saturating_mul(2u64.saturating_pow(attempt));
        delay.min(self.max_delay_secs)
    }
}

pub struct CloudMirrorSync {
    ledger: Arc<TradeLedger>,
    state_repo: SyncStateRepository,
    store: Arc<dyn MirrorStore>,
    environment: String,
    sync_interval_secs: u64,
    retry_policy: SyncRetryPolicy,
    phase: SyncPhase,
    failed_attempts: u32,
    next_attempt_after: Option<DateTime<Utc>>,
}

impl CloudMirrorSync {
    pub fn new(
        ledger: Arc<TradeLedger>,
        state_repo: SyncStateRepository,
        store: Arc<dyn MirrorStore>,
        environment: impl Into<String>,
        sync_interval_secs: u64,
    ) -> Self {
        Self {
            ledger,
            state_repo,
            store,
            environment: environment.into(),
            sync_interval_secs,
            retry_policy: SyncRetryPolicy::default(),
            phase: SyncPhase::Idle,
            failed_attempts: 0,
            next_attempt_after: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// One scheduled trigger. Errors are also recorded in the phase so the
    /// next trigger backs off; callers log and move on.
    pub async fn run_once(&mut self) -> Result<SyncOutcome, SyncError> {
        let now = Utc::now();

        if self.phase == SyncPhase::Failed {
            if let Some(after) = self.next_attempt_after {
                if now < after {
                    debug!(
                        "Sync backing off until {} (attempt {})",
                        after, self.failed_attempts
                    );
                    return Ok(SyncOutcome::BackingOff);
                }
            }
        }

        match self.run_round(now).await {
            Ok(outcome) => {
                if self.failed_attempts > 0 {
                    info!("Sync recovered after {} failed rounds", self.failed_attempts);
                }
                self.phase = SyncPhase::Idle;
                self.failed_attempts = 0;
                self.next_attempt_after = None;
                Ok(outcome)
            }
            Err(e) => {
                self.failed_attempts += 1;
                let delay = self.retry_policy.delay_for_attempt(self.failed_attempts - 1);
                self.phase = SyncPhase::Failed;
                self.next_attempt_after = Some(now + ChronoDuration::seconds(delay as i64));
                error!(
                    "Sync round failed (attempt {}), retrying after {}s: {}",
                    self.failed_attempts, delay, e
                );
                Err(e)
            }
        }
    }

    async fn run_round(&mut self, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        let mut state = self
            .state_repo
            .load(&self.environment)
            .await?
            .unwrap_or_else(|| SyncState::new(self.environment.clone(), self.sync_interval_secs));
        state.sync_interval_secs = self.sync_interval_secs;

        let local_hash = self.ledger.compute_content_hash().await?;
        state.local_hash = Some(local_hash.clone());

        if !state.should_sync(now) {
            self.state_repo.save(&state).await?;
            return Ok(SyncOutcome::NotDue);
        }

        self.phase = SyncPhase::Syncing;

        let manifest = self.store.fetch_manifest().await?;

        if let Some(ref manifest) = manifest {
            if manifest.environment != self.environment {
                return Err(SyncError::EnvironmentMismatch {
                    local: self.environment.clone(),
                    remote: manifest.environment.clone(),
                });
            }

            if manifest.content_hash == local_hash {
                state.remote_hash = Some(manifest.content_hash.clone());
                state.last_sync_time = Some(now);
                self.state_repo.save(&state).await?;
                debug!("Sync no-op: hashes already converged ({})", &local_hash[..12]);
                return Ok(SyncOutcome::NoOp);
            }
        }

        // Hashes diverged (or the mirror is empty): pull, merge, push.
        let remote_records = match manifest {
            Some(_) => self.store.pull_records().await?,
            None => Vec::new(),
        };
        let pulled = remote_records.len();

        let outcome = self.ledger.sync_merge(remote_records).await?;
        let pushed = outcome.merged_records.len();

        let new_manifest = MirrorManifest {
            environment: self.environment.clone(),
            content_hash: outcome.merged_hash.clone(),
            record_count: pushed,
            updated_by: self.environment.clone(),
            updated_at: now,
        };
        self.store
            .push_records(&outcome.merged_records, &new_manifest)
            .await?;

        state.local_hash = Some(outcome.merged_hash.clone());
        state.remote_hash = Some(outcome.merged_hash.clone());
        state.last_sync_time = Some(now);
        self.state_repo.save(&state).await?;

        info!(
            "Sync round complete: pulled {}, accepted {}, mirror now holds {} records, hash {}",
            pulled,
            outcome.accepted,
            pushed,
            &outcome.merged_hash[..12.min(outcome.merged_hash.len())]
        );
        if !outcome.to_push.is_empty() {
            debug!("Mirror lacked or lost {} records", outcome.to_push.len());
        }

        Ok(SyncOutcome::Synced {
            accepted: outcome.accepted,
            pushed,
        })
    }
}

/// Warn-level wrapper used by the scheduled task: failures are absorbed
/// here because the sync loop must keep running regardless.
pub async fn run_sync_tick(sync: &mut CloudMirrorSync) {
    match sync.run_once().await {
        Ok(SyncOutcome::Synced { accepted, pushed }) => {
            debug!("Sync tick: {} accepted, {} pushed", accepted, pushed);
        }
        Ok(_) => {}
        Err(e) => {
            warn!("Sync tick failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::trade::{TradeRecord, TradeSide, TradeSource, TradeStatus};
    use crate::persistence::init_database;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory mirror double with switchable failure modes.
    struct MemoryMirror {
        environment: String,
        manifest: Mutex<Option<MirrorManifest>>,
        records: Mutex<Vec<TradeRecord>>,
        fail_pull: Mutex<bool>,
        fail_push: Mutex<bool>,
    }

    impl MemoryMirror {
        fn new(environment: &str) -> Self {
            Self {
                environment: environment.to_string(),
                manifest: Mutex::new(None),
                records: Mutex::new(Vec::new()),
                fail_pull: Mutex::new(false),
                fail_push: Mutex::new(false),
            }
        }

        fn seed(&self, records: Vec<TradeRecord>, hash: &str) {
            *self.manifest.lock().unwrap() = Some(MirrorManifest {
                environment: self.environment.clone(),
                content_hash: hash.to_string(),
                record_count: records.len(),
                updated_by: "other-instance".to_string(),
                updated_at: Utc::now(),
            });
            *self.records.lock().unwrap() = records;
        }

        fn set_fail_push(&self, fail: bool) {
            *self.fail_push.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl MirrorStore for MemoryMirror {
        async fn fetch_manifest(&self) -> Result<Option<MirrorManifest>, SyncError> {
            Ok(self.manifest.lock().unwrap().clone())
        }

        async fn pull_records(&self) -> Result<Vec<TradeRecord>, SyncError> {
            if *self.fail_pull.lock().unwrap() {
                return Err(SyncError::Pull("simulated pull failure".to_string()));
            }
            Ok(self.records.lock().unwrap().clone())
        }

        async fn push_records(
            &self,
            records: &[TradeRecord],
            manifest: &MirrorManifest,
        ) -> Result<(), SyncError> {
            if *self.fail_push.lock().unwrap() {
                return Err(SyncError::Push("simulated push failure".to_string()));
            }
            *self.records.lock().unwrap() = records.to_vec();
            *self.manifest.lock().unwrap() = Some(manifest.clone());
            Ok(())
        }
    }

    fn record(id: &str, strategy: &str, symbol: &str) -> TradeRecord {
        let now = Utc::now();
        TradeRecord {
            id: id.to_string(),
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            side: TradeSide::Long,
            entry_price: 100.0,
            quantity: 1.0,
            margin: 20.0,
            leverage: 5,
            status: TradeStatus::Open,
            opened_at: now,
            closed_at: None,
            updated_at: now,
            exit_price: None,
            realized_pnl: None,
            exchange_position_ref: None,
            unrealized_pnl: None,
            source: TradeSource::Strategy,
            recovery_key: None,
        }
    }

    async fn setup(mirror: Arc<MemoryMirror>) -> (Arc<TradeLedger>, CloudMirrorSync, SyncStateRepository) {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let ledger = Arc::new(TradeLedger::new(pool.clone(), 1_000, 86_400));
        let sync = CloudMirrorSync::new(
            ledger.clone(),
            SyncStateRepository::new(pool.clone()),
            mirror,
            "sandbox",
            30,
        );
        (ledger, sync, SyncStateRepository::new(pool))
    }

    #[tokio::test]
    async fn first_round_uploads_local_ledger_and_converges_hashes() {
        let mirror = Arc::new(MemoryMirror::new("sandbox"));
        let (ledger, mut sync, state_repo) = setup(mirror.clone()).await;

        ledger
            .upsert(&record("t-1", "rsi_oversold", "BTCUSDT"), false)
            .await
            .unwrap();

        let outcome = sync.run_once().await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Synced { pushed: 1, .. }));
        assert_eq!(sync.phase(), SyncPhase::Idle);

        let state = state_repo.load("sandbox").await.unwrap().unwrap();
        assert!(state.local_hash.is_some());
        assert_eq!(state.local_hash, state.remote_hash);
        assert!(state.last_sync_time.is_some());

        let manifest = mirror.fetch_manifest().await.unwrap().unwrap();
        assert_eq!(Some(manifest.content_hash), state.local_hash);
    }

    #[tokio::test]
    async fn matching_hashes_make_the_round_a_no_op() {
        let mirror = Arc::new(MemoryMirror::new("sandbox"));
        let (ledger, mut sync, _) = setup(mirror.clone()).await;
        ledger
            .upsert(&record("t-1", "rsi_oversold", "BTCUSDT"), false)
            .await
            .unwrap();

        sync.run_once().await.unwrap();
        // Second trigger: interval not elapsed, hashes converged.
        assert_eq!(sync.run_once().await.unwrap(), SyncOutcome::NotDue);
    }

    #[tokio::test]
    async fn diverged_hashes_pull_merge_and_push() {
        let mirror = Arc::new(MemoryMirror::new("sandbox"));
        let (ledger, mut sync, state_repo) = setup(mirror.clone()).await;

        ledger
            .upsert(&record("t-local", "rsi_oversold", "BTCUSDT"), false)
            .await
            .unwrap();
        mirror.seed(vec![record("t-remote", "macd_divergence", "ETHUSDT")], "xyz");

        let outcome = sync.run_once().await.unwrap();
        match outcome {
            SyncOutcome::Synced { accepted, pushed } => {
                assert_eq!(accepted, 1);
                assert_eq!(pushed, 2);
            }
            other => panic!("expected full round, got {:?}", other),
        }

        // Remote record landed locally; both hashes hold the merged value.
        assert!(ledger.get_record("t-remote").await.unwrap().is_some());
        let state = state_repo.load("sandbox").await.unwrap().unwrap();
        assert_eq!(state.local_hash, state.remote_hash);
        let merged_hash = ledger.compute_content_hash().await.unwrap();
        assert_eq!(state.local_hash.as_deref(), Some(merged_hash.as_str()));
    }

    #[tokio::test]
    async fn push_failure_enters_failed_phase_and_backs_off() {
        let mirror = Arc::new(MemoryMirror::new("sandbox"));
        let (ledger, mut sync, _) = setup(mirror.clone()).await;
        ledger
            .upsert(&record("t-1", "rsi_oversold", "BTCUSDT"), false)
            .await
            .unwrap();
        mirror.set_fail_push(true);

        assert!(sync.run_once().await.is_err());
        assert_eq!(sync.phase(), SyncPhase::Failed);

        // Within the backoff window the manager does not retry.
        assert_eq!(sync.run_once().await.unwrap(), SyncOutcome::BackingOff);

        // The local ledger is untouched by the failure.
        assert_eq!(ledger.get_open(None, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_environment_mirror_is_rejected() {
        let mirror = Arc::new(MemoryMirror::new("production"));
        mirror.seed(vec![record("t-prod", "rsi_oversold", "BTCUSDT")], "prod-hash");
        let (_ledger, mut sync, _) = setup(mirror).await;

        let err = sync.run_once().await.unwrap_err();
        assert!(matches!(err, SyncError::EnvironmentMismatch { .. }));
        assert_eq!(sync.phase(), SyncPhase::Failed);
    }

    #[test]
    fn retry_policy_backs_off_exponentially_with_cap() {
        let policy = SyncRetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), 5);
        assert_eq!(policy.delay_for_attempt(1), 10);
        assert_eq!(policy.delay_for_attempt(2), 20);
        assert_eq!(policy.delay_for_attempt(10), 300);
    }
}
