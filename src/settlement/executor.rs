use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::U256;
use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use super::{SettlementBatch, SettlementStatus};
use crate::error::AppResult;
use crate::execution::contract::{SettleReceipt, SettlementContract};
use crate::ledger::models::InFlightSettlement;
use crate::ledger::LedgerStore;

/// Ground truth for one executed user, decided by the on-chain nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Nonce advanced: the settlement applied.
    Applied,
    /// Nonce unchanged: nothing applied this round.
    NotApplied,
    /// Submitted, but the outcome is unknown: the transaction may still be
    /// mined, or neither the nonce nor the receipt could be read.
    Indeterminate,
    /// Never submitted (pre-submission nonce read failed).
    NotSubmitted,
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub results: HashMap<String, ExecutionResult>,
    pub transactions: Vec<String>,
}

impl ExecutionReport {
    pub fn count(&self, wanted: ExecutionResult) -> usize {
        self.results.values().filter(|r| **r == wanted).count()
    }
}

/// Submits executable batches in bounded chunks.
pub struct SettlementExecutor {
    contract: Arc<dyn SettlementContract>,
    ledger: Arc<dyn LedgerStore>,
    chunk_size: usize,
}

impl SettlementExecutor {
    pub fn new(
        contract: Arc<dyn SettlementContract>,
        ledger: Arc<dyn LedgerStore>,
        chunk_size: usize,
    ) -> Self {
        Self {
            contract,
            ledger,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Chunks run one after another under the single provider sender. A
    /// failed chunk never aborts the next one; only a journal write failure
    /// ends the call.
    #[instrument(skip(self, batches), fields(batches = batches.len()))]
    pub async fn execute(
        &self,
        batches: &[SettlementBatch],
        now: DateTime<Utc>,
    ) -> AppResult<ExecutionReport> {
        let mut report = ExecutionReport::default();

        for (index, chunk) in batches.chunks(self.chunk_size).enumerate() {
            self.execute_chunk(index, chunk, now, &mut report).await?;
        }

        info!(
            "⛓️  Execution finished: {} applied, {} not applied, {} indeterminate, {} not submitted",
            report.count(ExecutionResult::Applied),
            report.count(ExecutionResult::NotApplied),
            report.count(ExecutionResult::Indeterminate),
            report.count(ExecutionResult::NotSubmitted),
        );
        Ok(report)
    }

    async fn execute_chunk(
        &self,
        index: usize,
        chunk: &[SettlementBatch],
        now: DateTime<Utc>,
        report: &mut ExecutionReport,
    ) -> AppResult<()> {
        // Nonces before submission
        let mut submitted: Vec<(&SettlementBatch, U256)> = Vec::with_capacity(chunk.len());
        for batch in chunk {
            match self.contract.get_account(batch.address()).await {
                Ok(account) => {
                    submitted.push((batch, account.map(|a| a.nonce).unwrap_or_default()));
                }
                Err(e) => {
                    warn!("⚠️  Nonce read for {} failed, not submitting: {}", batch.user, e);
                    report
                        .results
                        .insert(batch.user.clone(), ExecutionResult::NotSubmitted);
                }
            }
        }
        if submitted.is_empty() {
            return Ok(());
        }

        let journal: Vec<InFlightSettlement> = submitted
            .iter()
            .map(|(batch, _)| InFlightSettlement {
                user_address: batch.user.clone(),
                nonce: batch.nonce().to_string(),
                total_fee: batch.total_fee().to_string(),
                request_hashes: batch.request_hashes(),
                created_at: now,
            })
            .collect();
        self.ledger.record_inflight(&journal).await?;

        let settlements: Vec<_> = submitted.iter().map(|(b, _)| b.settlement.clone()).collect();
        let mut pending_on_chain = false;
        let receipt = match self.contract.settle_fees(&settlements).await {
            Ok(receipt) => {
                report.transactions.push(receipt.tx_hash.to_string());
                Some(receipt)
            }
            Err(e) => {
                error!("❌ Settlement chunk {} ({} users) failed: {}", index, settlements.len(), e);
                pending_on_chain = e.may_have_broadcast();
                None
            }
        };

        for (batch, before) in submitted {
            let result = match self.contract.get_account(batch.address()).await {
                Ok(account) => {
                    let after = account.map(|a| a.nonce).unwrap_or_default();
                    if after > before {
                        ExecutionResult::Applied
                    } else if pending_on_chain {
                        // Could still be mined; recovery decides
                        ExecutionResult::Indeterminate
                    } else {
                        ExecutionResult::NotApplied
                    }
                }
                Err(e) => {
                    warn!("⚠️  Post-settlement nonce read for {} failed: {}", batch.user, e);
                    result_from_events(receipt.as_ref(), batch)
                }
            };
            report.results.insert(batch.user.clone(), result);
        }
        Ok(())
    }
}

/// Fallback when the nonce cannot be read: trust the receipt's events.
fn result_from_events(receipt: Option<&SettleReceipt>, batch: &SettlementBatch) -> ExecutionResult {
    let Some(receipt) = receipt else {
        return ExecutionResult::Indeterminate;
    };
    let Some(event) = receipt.events.iter().find(|e| e.user == batch.address()) else {
        return ExecutionResult::Indeterminate;
    };
    match SettlementStatus::try_from(event.status) {
        Ok(SettlementStatus::Success) => ExecutionResult::Applied,
        Ok(SettlementStatus::Partial)
        | Ok(SettlementStatus::ProviderMismatch)
        | Ok(SettlementStatus::NoTeeSigner)
        | Ok(SettlementStatus::InvalidNonce)
        | Ok(SettlementStatus::InvalidSignature) => ExecutionResult::NotApplied,
        Err(_) => ExecutionResult::Indeterminate,
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ledger::LedgerStore;
    use crate::settlement::test_support::{Harness, USER_A, USER_B};

    #[tokio::test]
    async fn test_nonce_advance_decides_success() {
        let harness = Harness::new(10);
        harness.fund(USER_A, 100);
        harness.fund(USER_B, 100);
        harness.insert(USER_A, "a1", "10", 60).await;
        harness.insert(USER_B, "b1", "10", 60).await;
        // Preview was fine, but the chain rejects B at execution time
        harness.contract.reject_on_settle(USER_B);

        let now = Utc::now();
        let batches = harness.build_batches(now).await;
        let report = harness.executor().execute(&batches, now).await.unwrap();

        assert_eq!(report.results[USER_A], ExecutionResult::Applied);
        assert_eq!(report.results[USER_B], ExecutionResult::NotApplied);
        assert_eq!(report.transactions.len(), 1);
        assert_eq!(harness.ledger.list_inflight().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_abort_later_chunks() {
        let harness = Harness::new(1);
        harness.fund(USER_A, 100);
        harness.fund(USER_B, 100);
        harness.insert(USER_A, "a1", "10", 60).await;
        harness.insert(USER_B, "b1", "10", 60).await;
        harness.contract.fail_next_settles(1);

        let now = Utc::now();
        let batches = harness.build_batches(now).await;
        let report = harness.executor().execute(&batches, now).await.unwrap();

        assert_eq!(report.results[USER_A], ExecutionResult::NotApplied);
        assert_eq!(report.results[USER_B], ExecutionResult::Applied);
        assert_eq!(harness.contract.settle_calls(), 2);
    }

    #[tokio::test]
    async fn test_unreadable_nonce_after_failed_send_is_indeterminate() {
        let harness = Harness::new(10);
        harness.fund(USER_A, 100);
        harness.insert(USER_A, "a1", "10", 60).await;
        harness.contract.fail_next_settles(1);
        // pre-read succeeds, post-read fails
        harness.contract.fail_nonce_reads_after(1);

        let now = Utc::now();
        let batches = harness.build_batches(now).await;
        let report = harness.executor().execute(&batches, now).await.unwrap();

        assert_eq!(report.results[USER_A], ExecutionResult::Indeterminate);
    }

    #[tokio::test]
    async fn test_lost_receipt_with_unmoved_nonce_is_indeterminate() {
        let harness = Harness::new(10);
        harness.fund(USER_A, 100);
        harness.insert(USER_A, "a1", "10", 60).await;
        harness.contract.lose_next_receipt();

        let now = Utc::now();
        let batches = harness.build_batches(now).await;
        let report = harness.executor().execute(&batches, now).await.unwrap();

        // Not mined yet, but it may still be
        assert_eq!(report.results[USER_A], ExecutionResult::Indeterminate);
        assert_eq!(harness.ledger.list_inflight().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_journal_failure_is_fatal_before_submission() {
        let harness = Harness::new(10);
        harness.fund(USER_A, 100);
        harness.insert(USER_A, "a1", "10", 60).await;

        let now = Utc::now();
        let batches = harness.build_batches(now).await;
        harness.ledger.set_fail_writes(true);
        let result = harness.executor().execute(&batches, now).await;

        assert!(result.is_err());
        assert_eq!(harness.contract.settle_calls(), 0);
    }
}
