use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::accounts::AccountSync;
use super::adjuster::SettlementAdjuster;
use super::builder::{group_by_user, BatchBuilder};
use super::executor::{ExecutionReport, SettlementExecutor};
use super::preview::SettlementPreviewer;
use super::reconciler::{ReconcileSummary, SettlementReconciler};
use super::{SettlementOutcome, SettlementStatus};
use crate::config::{Config, PurgePolicy};
use crate::error::{AppResult, SettlementError};
use crate::execution::contract::SettlementContract;
use crate::execution::TeeSigner;
use crate::ledger::models::{AccountRiskFilter, RecordFilter};
use crate::ledger::LedgerStore;

/// Multiplier applied to the per-token price sum to get the top-up threshold.
pub const THRESHOLD_TOKENS: u64 = 5000;

/// Signing requests in flight per round.
const SIGNER_CONCURRENCY: usize = 8;

/// Preview calls in flight per round.
const PREVIEW_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub max_rounds: usize,
    pub skip_cooldown: Duration,
    pub inflight_expiry: Duration,
    pub old_request_threshold: Duration,
    pub auto_settle_buffer: Duration,
    pub purge_policy: PurgePolicy,
    pub input_price: U256,
    pub output_price: U256,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_rounds: 10,
            skip_cooldown: Duration::seconds(300),
            inflight_expiry: Duration::seconds(600),
            old_request_threshold: Duration::seconds(600),
            auto_settle_buffer: Duration::seconds(60),
            purge_policy: PurgePolicy::DeadLetter,
            input_price: U256::ZERO,
            output_price: U256::ZERO,
        }
    }
}

impl EngineConfig {
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let settlement = &config.settlement;
        let (input_price, output_price) = config.service.prices()?;
        Ok(Self {
            batch_size: settlement.batch_size,
            max_rounds: settlement.max_rounds as usize,
            skip_cooldown: secs(settlement.skip_cooldown_secs),
            inflight_expiry: secs(settlement.inflight_expiry_secs),
            old_request_threshold: secs(settlement.old_request_threshold_secs),
            auto_settle_buffer: secs(settlement.auto_settle_buffer_secs),
            purge_policy: settlement.purge_policy,
            input_price,
            output_price,
        })
    }

    /// Lock balance below which an account must be settled now.
    pub fn lock_balance_threshold(&self) -> U256 {
        self.input_price
            .saturating_add(self.output_price)
            .saturating_mul(U256::from(THRESHOLD_TOKENS))
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000).min(i64::MAX / 1000))
}

/// Why an invocation stopped looping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    BacklogEmpty,
    NoExecutableBatches,
    AllPermanent,
    NoProgress,
    RoundLimit,
    NothingAtRisk,
    Shutdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SettlementSummary {
    pub run_id: Uuid,
    pub rounds: usize,
    pub recovered_records: u64,
    pub settled_users: usize,
    pub settled_records: u64,
    pub deferred_records: u64,
    pub purged_records: u64,
    pub transactions: Vec<String>,
    pub exit: ExitReason,
}

impl SettlementSummary {
    fn new(exit: ExitReason) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            rounds: 0,
            recovered_records: 0,
            settled_users: 0,
            settled_records: 0,
            deferred_records: 0,
            purged_records: 0,
            transactions: Vec::new(),
            exit,
        }
    }

    fn absorb(&mut self, round: RoundSummary) {
        self.rounds += 1;
        self.settled_users += round.reconcile.settled_users;
        self.settled_records += round.reconcile.settled_records;
        self.deferred_records += round.reconcile.deferred_records;
        self.purged_records += round.reconcile.purged_records;
        self.transactions.extend(round.transactions);
    }
}

/// One pass of build, preview, adjust, execute and reconcile.
#[derive(Debug, Default)]
struct RoundSummary {
    reconcile: ReconcileSummary,
    transactions: Vec<String>,
    exit: Option<ExitReason>,
}

/// Drives settlement rounds. Invocations are serialised by one lock.
pub struct SettlementEngine {
    config: EngineConfig,
    ledger: Arc<dyn LedgerStore>,
    contract: Arc<dyn SettlementContract>,
    builder: Arc<BatchBuilder>,
    previewer: SettlementPreviewer,
    adjuster: SettlementAdjuster,
    executor: SettlementExecutor,
    reconciler: SettlementReconciler,
    accounts: Arc<AccountSync>,
    round_lock: Mutex<()>,
    shutdown: watch::Receiver<bool>,
}

impl SettlementEngine {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn LedgerStore>,
        contract: Arc<dyn SettlementContract>,
        signer: Arc<dyn TeeSigner>,
        accounts: Arc<AccountSync>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let builder = Arc::new(BatchBuilder::new(
            signer,
            contract.provider_address(),
            SIGNER_CONCURRENCY,
        ));
        let previewer =
            SettlementPreviewer::new(contract.clone(), config.batch_size, PREVIEW_CONCURRENCY);
        let adjuster = SettlementAdjuster::new(builder.clone(), ledger.clone(), config.skip_cooldown);
        let executor = SettlementExecutor::new(contract.clone(), ledger.clone(), config.batch_size);
        let reconciler = SettlementReconciler::new(
            ledger.clone(),
            config.purge_policy,
            config.skip_cooldown,
            config.old_request_threshold,
        );

        Self {
            config,
            ledger,
            contract,
            builder,
            previewer,
            adjuster,
            executor,
            reconciler,
            accounts,
            round_lock: Mutex::new(()),
            shutdown,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn accounts(&self) -> &AccountSync {
        &self.accounts
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // ========== ENTRY POINTS ==========

    /// Unbounded drain for administrative and periodic full settlement.
    pub async fn force_settle(&self) -> AppResult<SettlementSummary> {
        let _guard = self.round_lock.lock().await;
        self.drain(None).await
    }

    /// Settle only when some account is close to running out of lock balance.
    #[instrument(skip(self))]
    pub async fn process_settlement(&self) -> AppResult<SettlementSummary> {
        let _guard = self.round_lock.lock().await;
        let now = Utc::now();

        let lock_time = self.contract.lock_time().await?;
        let threshold = self.config.lock_balance_threshold();
        let stale_before = now - secs(lock_time) + self.config.auto_settle_buffer;

        let candidates = self
            .ledger
            .list_accounts_at_risk(&AccountRiskFilter {
                lock_balance_threshold: threshold,
                stale_before: Some(stale_before),
            })
            .await?;
        if candidates.is_empty() {
            debug!("No account close to its settlement threshold");
            return Ok(SettlementSummary::new(ExitReason::NothingAtRisk));
        }

        // Cached balances may be stale: decide again on fresh chain data
        self.accounts.sync_all().await?;
        let at_risk = self
            .ledger
            .list_accounts_at_risk(&AccountRiskFilter {
                lock_balance_threshold: threshold,
                stale_before: None,
            })
            .await?;
        if at_risk.is_empty() {
            info!("✓ {} candidate accounts are healthy after sync", candidates.len());
            return Ok(SettlementSummary::new(ExitReason::NothingAtRisk));
        }

        info!(
            "⏰ {} accounts below threshold {}, settling",
            at_risk.len(),
            threshold
        );
        self.drain(Some(self.config.max_rounds)).await
    }

    // ========== ROUND DRIVER ==========

    #[instrument(skip(self))]
    async fn drain(&self, max_rounds: Option<usize>) -> AppResult<SettlementSummary> {
        let now = Utc::now();
        self.ledger.clear_expired_skip_until(now).await?;
        let recovered = self.recover_inflight(now).await?;

        let mut summary = SettlementSummary::new(ExitReason::RoundLimit);
        summary.recovered_records = recovered;
        debug!(run_id = %summary.run_id, "Settlement run started");

        loop {
            if self.is_shutting_down() {
                summary.exit = ExitReason::Shutdown;
                break;
            }
            if max_rounds.is_some_and(|limit| summary.rounds >= limit) {
                summary.exit = ExitReason::RoundLimit;
                break;
            }

            let round = self.run_round(summary.rounds + 1).await?;
            let exit = round.exit;
            summary.absorb(round);
            if let Some(exit) = exit {
                summary.exit = exit;
                break;
            }
        }

        info!(
            run_id = %summary.run_id,
            "🏁 Settlement finished after {} rounds ({:?}): {} settled, {} deferred, {} purged",
            summary.rounds,
            summary.exit,
            summary.settled_records,
            summary.deferred_records,
            summary.purged_records
        );
        Ok(summary)
    }

    #[instrument(skip(self), fields(round = round))]
    async fn run_round(&self, round: usize) -> AppResult<RoundSummary> {
        let now = Utc::now();
        let mut summary = RoundSummary::default();

        let blocked: HashSet<String> = self
            .ledger
            .list_inflight()
            .await?
            .into_iter()
            .map(|entry| entry.user_address)
            .collect();
        let filter = RecordFilter::eligible_at(now, self.config.old_request_threshold);
        let records: Vec<_> = self
            .ledger
            .list_eligible_records(&filter)
            .await?
            .into_iter()
            .filter(|r| !blocked.contains(&r.user_address))
            .collect();

        if records.is_empty() {
            self.reconciler.finish(now, &mut summary.reconcile).await?;
            summary.exit = Some(if summary.reconcile.backlog_empty {
                ExitReason::BacklogEmpty
            } else {
                ExitReason::NoExecutableBatches
            });
            return Ok(summary);
        }

        let grouped = group_by_user(records);
        if !grouped.unpriceable.is_empty() {
            summary.reconcile.deferred_records += self
                .ledger
                .update_skip_until(&grouped.unpriceable, now + self.config.skip_cooldown)
                .await?;
        }

        let batches = self.builder.build(grouped.users, now).await;
        if batches.is_empty() {
            warn!("⚠️  No batch could be signed in round {}", round);
            summary.exit = Some(ExitReason::NoExecutableBatches);
            return Ok(summary);
        }

        let outcomes = self.previewer.preview(&batches).await;

        let mut executable = Vec::with_capacity(batches.len());
        let mut rejected = Vec::new();
        for batch in batches {
            let outcome = outcomes
                .get(&batch.user)
                .cloned()
                .unwrap_or_else(|| SettlementOutcome::conservative(batch.total_fee()));
            match outcome.status {
                SettlementStatus::Success => executable.push(batch),
                SettlementStatus::Partial => {
                    let adjustment = self
                        .adjuster
                        .adjust(batch, outcome.unsettled_amount, now)
                        .await?;
                    summary.reconcile.deferred_records += adjustment.deferred.len() as u64;
                    executable.extend(adjustment.batch);
                }
                SettlementStatus::ProviderMismatch
                | SettlementStatus::NoTeeSigner
                | SettlementStatus::InvalidNonce
                | SettlementStatus::InvalidSignature => rejected.push((batch, outcome)),
            }
        }

        self.reconciler
            .apply_rejections(&rejected, now, &mut summary.reconcile)
            .await?;

        let report = if executable.is_empty() {
            ExecutionReport::default()
        } else {
            self.executor.execute(&executable, now).await?
        };
        self.reconciler
            .apply_execution(&executable, &report.results, now, &mut summary.reconcile)
            .await?;
        self.reconciler.finish(now, &mut summary.reconcile).await?;
        summary.transactions = report.transactions;

        let all_permanent = !rejected.is_empty() && rejected.iter().all(|(_, o)| o.status.is_permanent());
        summary.exit = if summary.reconcile.backlog_empty {
            Some(ExitReason::BacklogEmpty)
        } else if executable.is_empty() && all_permanent {
            Some(ExitReason::AllPermanent)
        } else if executable.is_empty() {
            Some(ExitReason::NoExecutableBatches)
        } else if !summary.reconcile.made_progress() {
            Some(ExitReason::NoProgress)
        } else {
            None
        };

        info!(
            "🔄 Round {}: {} executable, {} rejected, {} settled records, {} deferred",
            round,
            executable.len(),
            rejected.len(),
            summary.reconcile.settled_records,
            summary.reconcile.deferred_records
        );
        Ok(summary)
    }

    // ========== RECOVERY ==========

    /// Resolve journal entries left by an interrupted invocation.
    ///
    /// An entry whose on-chain nonce reached the journaled nonce was applied:
    /// its records are deleted. Unresolved entries block their user until
    /// they expire.
    pub async fn recover_inflight(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let entries = self.ledger.list_inflight().await?;
        let mut recovered = 0;

        for entry in entries {
            let user = entry.user_address.clone();
            let journaled = entry.nonce_value()?;
            let address =
                Address::from_str(&user).map_err(|_| SettlementError::InvalidUser(user.clone()))?;

            match self.contract.get_account(address).await {
                Ok(account) => {
                    let onchain = account.map(|a| a.nonce).unwrap_or_default();
                    if onchain >= journaled {
                        let deleted = self
                            .ledger
                            .delete_settled_records(&entry.request_hashes)
                            .await?;
                        self.ledger.clear_inflight(&[user.clone()]).await?;
                        recovered += deleted;
                        info!(user = %user, nonce = %journaled, "♻️  Recovered applied settlement, {} records removed", deleted);
                        continue;
                    }
                }
                Err(e) => {
                    error!(user = %user, "❌ Could not read nonce during recovery: {}", e);
                }
            }

            if entry.is_expired(now, self.config.inflight_expiry) {
                self.ledger.clear_inflight(&[user.clone()]).await?;
                warn!(user = %user, "⌛ Dropped expired in-flight entry, records will be retried");
            } else {
                debug!(user = %user, "In-flight settlement still unresolved");
            }
        }
        Ok(recovered)
    }
}
