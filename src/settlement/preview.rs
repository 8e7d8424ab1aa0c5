use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::Address;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};

use super::{SettlementBatch, SettlementOutcome, SettlementStatus};
use crate::execution::contract::{PreviewReport, SettlementContract};

/// Read-only classification of each user's batch against current chain state.
pub struct SettlementPreviewer {
    contract: Arc<dyn SettlementContract>,
    chunk_size: usize,
    concurrency: usize,
}

impl SettlementPreviewer {
    pub fn new(
        contract: Arc<dyn SettlementContract>,
        chunk_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            contract,
            chunk_size: chunk_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    /// Outcome per user key. At most `concurrency` chunks are previewed at
    /// once; a failed chunk marks its users as paying nothing.
    pub async fn preview(&self, batches: &[SettlementBatch]) -> HashMap<String, SettlementOutcome> {
        let chunks: Vec<&[SettlementBatch]> = batches.chunks(self.chunk_size).collect();

        let previews: Vec<_> = chunks
            .iter()
            .copied()
            .map(|chunk| async move {
                let settlements: Vec<_> = chunk.iter().map(|b| b.settlement.clone()).collect();
                self.contract.preview_settlements(&settlements).await
            })
            .collect();
        let results: Vec<_> = stream::iter(previews)
        .buffered(self.concurrency)
        .collect()
        .await;

        let mut outcomes = HashMap::with_capacity(batches.len());
        for (index, (chunk, result)) in chunks.iter().zip(results).enumerate() {
            match result {
                Ok(report) => outcomes.extend(classify_chunk(chunk, &report)),
                Err(e) => {
                    warn!(
                        "⚠️  Preview of chunk {} ({} users) failed, assuming nothing payable: {}",
                        index,
                        chunk.len(),
                        e
                    );
                    for batch in chunk.iter() {
                        outcomes.insert(
                            batch.user.clone(),
                            SettlementOutcome::conservative(batch.total_fee()),
                        );
                    }
                }
            }
        }

        let mut counts: HashMap<SettlementStatus, usize> = HashMap::new();
        for outcome in outcomes.values() {
            *counts.entry(outcome.status).or_default() += 1;
        }
        info!("🔍 Preview of {} batches: {:?}", batches.len(), counts);
        outcomes
    }
}

/// Map a chunk's raw preview report onto its batches.
pub fn classify_chunk(
    chunk: &[SettlementBatch],
    report: &PreviewReport,
) -> HashMap<String, SettlementOutcome> {
    let by_address: HashMap<Address, &SettlementBatch> =
        chunk.iter().map(|b| (b.address(), b)).collect();

    let mut outcomes: HashMap<String, SettlementOutcome> = chunk
        .iter()
        .map(|b| (b.user.clone(), SettlementOutcome::success()))
        .collect();

    for (address, code) in &report.failed {
        let Some(batch) = by_address.get(address) else {
            warn!("Preview reported unknown user {}", address);
            continue;
        };
        let outcome = match SettlementStatus::try_from(*code) {
            Ok(SettlementStatus::Success) => SettlementOutcome::success(),
            // Partial without an amount
            Ok(SettlementStatus::Partial) => SettlementOutcome::conservative(batch.total_fee()),
            Ok(
                status @ (SettlementStatus::ProviderMismatch
                | SettlementStatus::NoTeeSigner
                | SettlementStatus::InvalidNonce
                | SettlementStatus::InvalidSignature),
            ) => SettlementOutcome {
                status,
                unsettled_amount: batch.total_fee(),
            },
            Err(unknown) => {
                warn!("Unknown settlement status {} for {}", unknown, address);
                SettlementOutcome::conservative(batch.total_fee())
            }
        };
        outcomes.insert(batch.user.clone(), outcome);
    }

    for (address, unsettled) in &report.partial {
        let Some(batch) = by_address.get(address) else {
            warn!("Preview reported partial for unknown user {}", address);
            continue;
        };
        let Some(current) = outcomes.get_mut(&batch.user) else {
            continue;
        };
        // A failure reason outranks a partial amount
        if current.status == SettlementStatus::Success || current.status == SettlementStatus::Partial {
            *current = SettlementOutcome {
                status: SettlementStatus::Partial,
                unsettled_amount: (*unsettled).min(batch.total_fee()),
            };
        }
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use alloy_primitives::U256;
    use chrono::Utc;

    use super::*;
    use crate::settlement::test_support::{Harness, SlowPreviews, USER_A, USER_B, USER_C};

    #[tokio::test]
    async fn test_preview_classifies_each_user() {
        let harness = Harness::new(2);
        harness.fund(USER_A, 100);
        harness.fund(USER_B, 4);
        // USER_C never acknowledged a TEE signer
        harness.insert(USER_A, "a1", "10", 60).await;
        harness.insert(USER_B, "b1", "3", 60).await;
        harness.insert(USER_B, "b2", "5", 50).await;
        harness.insert(USER_C, "c1", "1", 60).await;

        let batches = harness.build_batches(Utc::now()).await;
        let outcomes = harness.previewer().preview(&batches).await;

        assert_eq!(outcomes[USER_A], SettlementOutcome::success());
        assert_eq!(
            outcomes[USER_B],
            SettlementOutcome {
                status: SettlementStatus::Partial,
                unsettled_amount: U256::from(4u64),
            }
        );
        assert_eq!(outcomes[USER_C].status, SettlementStatus::NoTeeSigner);
    }

    #[tokio::test]
    async fn test_failed_chunk_is_conservative_and_isolated() {
        // chunk size 1: each user previewed on its own
        let harness = Harness::new(1);
        harness.fund(USER_A, 100);
        harness.fund(USER_B, 100);
        harness.insert(USER_A, "a1", "10", 60).await;
        harness.insert(USER_B, "b1", "7", 60).await;
        harness.contract.fail_preview_for(USER_A);

        let batches = harness.build_batches(Utc::now()).await;
        let outcomes = harness.previewer().preview(&batches).await;

        assert_eq!(
            outcomes[USER_A],
            SettlementOutcome::conservative(U256::from(10u64))
        );
        assert_eq!(outcomes[USER_B], SettlementOutcome::success());
    }

    #[tokio::test]
    async fn test_preview_chunks_respect_concurrency_limit() {
        let harness = Harness::new(1);
        for user in [USER_A, USER_B, USER_C] {
            harness.fund(user, 100);
            harness.insert(user, &format!("{}-1", user), "1", 60).await;
        }
        let batches = harness.build_batches(Utc::now()).await;
        let contract = Arc::new(SlowPreviews::new(harness.contract.clone(), 20));

        let outcomes = SettlementPreviewer::new(contract.clone(), 1, 2)
            .preview(&batches)
            .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(contract.peak(), 2);
    }

    #[tokio::test]
    async fn test_unknown_status_code_is_conservative() {
        let harness = Harness::new(4);
        harness.fund(USER_A, 100);
        harness.insert(USER_A, "a1", "10", 60).await;
        let batches = harness.build_batches(Utc::now()).await;

        let report = PreviewReport {
            failed: vec![(batches[0].address(), 42)],
            partial: vec![],
        };
        let outcomes = classify_chunk(&batches, &report);
        assert_eq!(
            outcomes[USER_A],
            SettlementOutcome::conservative(U256::from(10u64))
        );
    }
}
