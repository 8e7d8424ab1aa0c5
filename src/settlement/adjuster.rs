use std::sync::Arc;

use alloy_primitives::U256;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::builder::BatchBuilder;
use super::SettlementBatch;
use crate::error::AppResult;
use crate::ledger::LedgerStore;

/// Length of the oldest-first prefix whose fees fit in `settleable`.
///
/// A record is taken only if the remaining budget covers it whole; the walk
/// stops at the first record that does not fit.
pub fn select_fifo_prefix(fees: &[U256], settleable: U256) -> usize {
    let mut remaining = settleable;
    let mut taken = 0;
    for fee in fees {
        if remaining < *fee {
            break;
        }
        remaining -= *fee;
        taken += 1;
    }
    taken
}

#[derive(Debug)]
pub struct Adjustment {
    /// Re-signed batch over the payable prefix, if any record fits
    pub batch: Option<SettlementBatch>,
    /// Suffix put on cool-down
    pub deferred: Vec<String>,
}

/// Shrinks partially payable batches to what the chain approved.
pub struct SettlementAdjuster {
    builder: Arc<BatchBuilder>,
    ledger: Arc<dyn LedgerStore>,
    cooldown: Duration,
}

impl SettlementAdjuster {
    pub fn new(builder: Arc<BatchBuilder>, ledger: Arc<dyn LedgerStore>, cooldown: Duration) -> Self {
        Self {
            builder,
            ledger,
            cooldown,
        }
    }

    /// Persisting the suffix cool-down is the only fallible ledger step; a
    /// signing failure only drops the prefix for this round.
    pub async fn adjust(
        &self,
        batch: SettlementBatch,
        unsettled_amount: U256,
        now: DateTime<Utc>,
    ) -> AppResult<Adjustment> {
        let settleable = batch.total_fee().saturating_sub(unsettled_amount);
        let fees: Vec<U256> = batch.records.iter().map(|r| r.fee).collect();
        let keep = select_fifo_prefix(&fees, settleable);

        let SettlementBatch {
            user,
            mut records,
            settlement,
            message_hash,
        } = batch;
        let deferred: Vec<String> = records
            .split_off(keep)
            .into_iter()
            .map(|r| r.record.request_hash)
            .collect();

        if !deferred.is_empty() {
            self.ledger
                .update_skip_until(&deferred, now + self.cooldown)
                .await?;
        }

        info!(
            "✂️  Partial settlement for {}: settleable {}, keeping {} records, deferring {}",
            user,
            settleable,
            records.len(),
            deferred.len()
        );

        if records.is_empty() {
            return Ok(Adjustment {
                batch: None,
                deferred,
            });
        }

        // Same record set, same signature
        if deferred.is_empty() {
            return Ok(Adjustment {
                batch: Some(SettlementBatch {
                    user,
                    records,
                    settlement,
                    message_hash,
                }),
                deferred,
            });
        }

        match self
            .builder
            .sign_records(&user, settlement.user, records, settlement.nonce)
            .await
        {
            Ok(batch) => Ok(Adjustment {
                batch: Some(batch),
                deferred,
            }),
            Err(e) => {
                warn!("⚠️  Re-signing adjusted batch for {} failed: {}", user, e);
                Ok(Adjustment {
                    batch: None,
                    deferred,
                })
            }
        }
    }
}
