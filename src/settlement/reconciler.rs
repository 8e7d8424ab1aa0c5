use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::executor::ExecutionResult;
use super::{SettlementBatch, SettlementOutcome, SettlementStatus};
use crate::config::PurgePolicy;
use crate::error::AppResult;
use crate::ledger::models::RecordFilter;
use crate::ledger::LedgerStore;

/// What one round's reconciliation changed in the ledger.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub settled_users: usize,
    pub settled_records: u64,
    pub deferred_records: u64,
    pub purged_users: usize,
    pub purged_records: u64,
    pub backlog_empty: bool,
}

impl ReconcileSummary {
    /// A round that neither removed nor deferred anything made no progress.
    pub fn made_progress(&self) -> bool {
        self.settled_records > 0 || self.deferred_records > 0 || self.purged_records > 0
    }
}

/// Applies a round's final per-user outcomes to the ledger.
pub struct SettlementReconciler {
    ledger: Arc<dyn LedgerStore>,
    purge_policy: PurgePolicy,
    cooldown: Duration,
    old_request_threshold: Duration,
}

impl SettlementReconciler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        purge_policy: PurgePolicy,
        cooldown: Duration,
        old_request_threshold: Duration,
    ) -> Self {
        Self {
            ledger,
            purge_policy,
            cooldown,
            old_request_threshold,
        }
    }

    /// Executed batches: settled records are deleted here and nowhere else.
    pub async fn apply_execution(
        &self,
        executed: &[SettlementBatch],
        results: &HashMap<String, ExecutionResult>,
        now: DateTime<Utc>,
        summary: &mut ReconcileSummary,
    ) -> AppResult<()> {
        for batch in executed {
            let Some(result) = results.get(&batch.user) else {
                continue;
            };
            match result {
                ExecutionResult::Applied => {
                    let deleted = self
                        .ledger
                        .delete_settled_records(&batch.request_hashes())
                        .await?;
                    self.ledger.clear_inflight(&[batch.user.clone()]).await?;
                    summary.settled_users += 1;
                    summary.settled_records += deleted;
                    info!(
                        user = %batch.user,
                        nonce = %batch.nonce(),
                        "✅ Settled {} records ({} total fee)",
                        deleted,
                        batch.total_fee()
                    );
                }
                ExecutionResult::NotApplied => {
                    // Prefix is retried next round without a cool-down
                    self.ledger.clear_inflight(&[batch.user.clone()]).await?;
                    warn!(user = %batch.user, "⚠️  Settlement did not advance the nonce");
                }
                ExecutionResult::Indeterminate => {
                    // Journal entry stays open for recovery
                    summary.deferred_records += self
                        .ledger
                        .update_skip_until(&batch.request_hashes(), now + self.cooldown)
                        .await?;
                    warn!(user = %batch.user, "⚠️  Settlement outcome unknown, deferring to recovery");
                }
                ExecutionResult::NotSubmitted => {
                    debug!(user = %batch.user, "Batch was not submitted");
                }
            }
        }
        Ok(())
    }

    /// Users that preview excluded from execution.
    pub async fn apply_rejections(
        &self,
        rejected: &[(SettlementBatch, SettlementOutcome)],
        now: DateTime<Utc>,
        summary: &mut ReconcileSummary,
    ) -> AppResult<()> {
        for (batch, outcome) in rejected {
            match outcome.status {
                SettlementStatus::NoTeeSigner | SettlementStatus::ProviderMismatch => {
                    let purged = self
                        .ledger
                        .purge_user_records(&batch.user, outcome.status.as_str(), self.purge_policy, now)
                        .await?;
                    summary.purged_users += 1;
                    summary.purged_records += purged;
                    warn!(
                        user = %batch.user,
                        "🗑️  Permanent failure {}: purged {} records ({:?})",
                        outcome.status,
                        purged,
                        self.purge_policy
                    );
                }
                SettlementStatus::InvalidNonce | SettlementStatus::InvalidSignature => {
                    summary.deferred_records += self
                        .ledger
                        .update_skip_until(&batch.request_hashes(), now + self.cooldown)
                        .await?;
                    warn!(
                        user = %batch.user,
                        "⏳ Retryable failure {}, cooling down {} records",
                        outcome.status,
                        batch.records.len()
                    );
                }
                SettlementStatus::Success | SettlementStatus::Partial => {
                    // Executable outcomes never reach this path
                    debug!(user = %batch.user, "No rejection to apply for {}", outcome.status);
                }
            }
        }
        Ok(())
    }

    /// Resets the unsettled aggregate once nothing is left to settle.
    pub async fn finish(&self, now: DateTime<Utc>, summary: &mut ReconcileSummary) -> AppResult<()> {
        let filter = RecordFilter::eligible_at(now, self.old_request_threshold);
        let remaining = self.ledger.count_eligible_records(&filter).await?;
        if remaining == 0 {
            self.ledger.reset_unsettled_fees().await?;
            summary.backlog_empty = true;
            info!("🧹 Backlog drained, unsettled fees reset");
        } else {
            debug!("{} eligible records remain", remaining);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use chrono::Utc;

    use super::*;
    use crate::settlement::test_support::{Harness, USER_A, USER_B};

    fn reconciler(harness: &Harness, policy: PurgePolicy) -> SettlementReconciler {
        SettlementReconciler::new(
            harness.ledger.clone(),
            policy,
            Duration::seconds(300),
            Duration::seconds(600),
        )
    }

    #[tokio::test]
    async fn test_applied_deletes_only_the_executed_prefix() {
        let harness = Harness::new(10);
        harness.insert(USER_A, "r1", "3", 30).await;
        harness.insert(USER_A, "r2", "5", 20).await;
        let now = Utc::now();
        let mut batch = harness.build_batches(now).await.remove(0);
        batch.records.truncate(1);

        let results = HashMap::from([(USER_A.to_string(), ExecutionResult::Applied)]);
        let mut summary = ReconcileSummary::default();
        reconciler(&harness, PurgePolicy::DeadLetter)
            .apply_execution(&[batch], &results, now, &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.settled_records, 1);
        assert!(harness.ledger.record("r1").is_none());
        assert!(harness.ledger.record("r2").is_some());
    }

    #[tokio::test]
    async fn test_not_applied_keeps_prefix_immediately_retryable() {
        let harness = Harness::new(10);
        harness.insert(USER_A, "r1", "3", 30).await;
        let now = Utc::now();
        let batch = harness.build_batches(now).await.remove(0);

        let results = HashMap::from([(USER_A.to_string(), ExecutionResult::NotApplied)]);
        let mut summary = ReconcileSummary::default();
        reconciler(&harness, PurgePolicy::DeadLetter)
            .apply_execution(&[batch], &results, now, &mut summary)
            .await
            .unwrap();

        let record = harness.ledger.record("r1").unwrap();
        assert!(record.skip_until.is_none());
        assert!(!summary.made_progress());
    }

    #[tokio::test]
    async fn test_permanent_failure_purges_all_user_records() {
        let harness = Harness::new(10);
        harness.insert(USER_A, "r1", "3", 30).await;
        harness.insert(USER_A, "r2", "5", 20).await;
        harness.insert(USER_B, "b1", "1", 20).await;
        let now = Utc::now();
        let mut batch = harness.build_batches(now).await.remove(0);
        // Only r1 was in this round's batch
        batch.records.truncate(1);

        let outcome = SettlementOutcome {
            status: SettlementStatus::NoTeeSigner,
            unsettled_amount: U256::from(3u64),
        };
        let mut summary = ReconcileSummary::default();
        reconciler(&harness, PurgePolicy::DeadLetter)
            .apply_rejections(&[(batch, outcome)], now, &mut summary)
            .await
            .unwrap();

        assert_eq!(summary.purged_records, 2);
        assert!(harness.ledger.record("r2").is_none());
        assert!(harness.ledger.record("b1").is_some());
        let dead = harness.ledger.list_dead_letters(Some(USER_A)).await.unwrap();
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|d| d.reason == "NO_TEE_SIGNER"));
    }

    #[tokio::test]
    async fn test_forgive_policy_leaves_no_dead_letters() {
        let harness = Harness::new(10);
        harness.insert(USER_A, "r1", "3", 30).await;
        let now = Utc::now();
        let batch = harness.build_batches(now).await.remove(0);

        let outcome = SettlementOutcome {
            status: SettlementStatus::ProviderMismatch,
            unsettled_amount: U256::from(3u64),
        };
        let mut summary = ReconcileSummary::default();
        reconciler(&harness, PurgePolicy::Forgive)
            .apply_rejections(&[(batch, outcome)], now, &mut summary)
            .await
            .unwrap();

        assert_eq!(harness.ledger.record_count(), 0);
        assert!(harness.ledger.list_dead_letters(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retryable_failure_cools_down_batch() {
        let harness = Harness::new(10);
        harness.insert(USER_A, "r1", "3", 30).await;
        let now = Utc::now();
        let batch = harness.build_batches(now).await.remove(0);

        let outcome = SettlementOutcome {
            status: SettlementStatus::InvalidNonce,
            unsettled_amount: U256::from(3u64),
        };
        let mut summary = ReconcileSummary::default();
        let reconciler = reconciler(&harness, PurgePolicy::DeadLetter);
        reconciler
            .apply_rejections(&[(batch, outcome)], now, &mut summary)
            .await
            .unwrap();
        reconciler.finish(now, &mut summary).await.unwrap();

        assert_eq!(summary.deferred_records, 1);
        assert!(harness.ledger.record("r1").unwrap().skip_until.is_some());
        // Skipped records are not eligible, so the backlog counts as drained
        assert!(summary.backlog_empty);
    }
}
