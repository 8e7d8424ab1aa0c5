use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use alloy_primitives::{keccak256, Address, B256, U256};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use super::{PricedRecord, SettlementBatch, UserRequests};
use crate::error::{AppResult, SettlementError};
use crate::execution::{TEESettlementData, TeeSigner};
use crate::ledger::models::PendingUsageRecord;

/// Settlement nonces are unix seconds scaled by this factor.
pub const NONCE_SCALE: u64 = 10_000_000;

/// Wall-clock derived settlement nonces, strictly increasing per process.
#[derive(Default)]
pub struct NonceGenerator {
    last: Mutex<U256>,
}

impl NonceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, now: DateTime<Utc>) -> U256 {
        let secs = u64::try_from(now.timestamp()).unwrap_or_default();
        let candidate = U256::from(secs) * U256::from(NONCE_SCALE);
        let mut last = self.last.lock();
        let nonce = candidate.max(*last + U256::from(1u8));
        *last = nonce;
        nonce
    }
}

/// Records grouped per user plus the hashes that could not be priced.
#[derive(Debug, Default)]
pub struct GroupedRequests {
    pub users: Vec<UserRequests>,
    pub unpriceable: Vec<String>,
}

/// Group records by user, oldest first within each user.
///
/// Records with an unparsable fee, and every record of a user whose address
/// does not parse, are returned separately so they can be cooled down.
pub fn group_by_user(records: Vec<PendingUsageRecord>) -> GroupedRequests {
    let mut by_user: BTreeMap<String, Vec<PricedRecord>> = BTreeMap::new();
    let mut unpriceable = Vec::new();

    for record in records {
        match record.fee_amount() {
            Ok(fee) => by_user
                .entry(record.user_address.clone())
                .or_default()
                .push(PricedRecord { record, fee }),
            Err(e) => {
                error!("❌ Unpriceable record {}: {}", record.request_hash, e);
                unpriceable.push(record.request_hash);
            }
        }
    }

    let mut users = Vec::with_capacity(by_user.len());
    for (user, mut records) in by_user {
        let Ok(address) = Address::from_str(&user) else {
            error!("❌ Invalid user address {} on {} records", user, records.len());
            unpriceable.extend(records.into_iter().map(|r| r.record.request_hash));
            continue;
        };
        records.sort_by(|a, b| {
            a.record
                .created_at
                .cmp(&b.record.created_at)
                .then_with(|| a.record.request_hash.cmp(&b.record.request_hash))
        });
        users.push(UserRequests {
            user,
            address,
            records,
        });
    }

    GroupedRequests { users, unpriceable }
}

/// Digest binding a claimed amount to the exact ordered record set.
pub fn requests_hash(records: &[PricedRecord]) -> B256 {
    let mut data = Vec::new();
    for priced in records {
        let r = &priced.record;
        data.extend_from_slice(r.request_hash.as_bytes());
        data.extend_from_slice(r.user_address.as_bytes());
        data.extend_from_slice(r.fee.as_bytes());
        data.extend_from_slice(r.input_fee.as_bytes());
        data.extend_from_slice(r.output_fee.as_bytes());
    }
    keccak256(&data)
}

/// `keccak256(requestsHash ‖ pad32(nonce) ‖ provider ‖ user ‖ pad32(totalFee))`
pub fn message_hash(
    requests_hash: B256,
    nonce: U256,
    provider: Address,
    user: Address,
    total_fee: U256,
) -> B256 {
    let mut data = Vec::with_capacity(32 + 32 + 20 + 20 + 32);
    data.extend_from_slice(requests_hash.as_slice());
    data.extend_from_slice(&nonce.to_be_bytes::<32>());
    data.extend_from_slice(provider.as_slice());
    data.extend_from_slice(user.as_slice());
    data.extend_from_slice(&total_fee.to_be_bytes::<32>());
    keccak256(&data)
}

/// Builds and signs per-user settlement batches.
pub struct BatchBuilder {
    signer: Arc<dyn TeeSigner>,
    provider: Address,
    nonces: NonceGenerator,
    concurrency: usize,
}

impl BatchBuilder {
    pub fn new(signer: Arc<dyn TeeSigner>, provider: Address, concurrency: usize) -> Self {
        Self {
            signer,
            provider,
            nonces: NonceGenerator::new(),
            concurrency: concurrency.max(1),
        }
    }

    pub fn provider(&self) -> Address {
        self.provider
    }

    /// Sign one batch per user. A signer failure drops only that user.
    pub async fn build(&self, users: Vec<UserRequests>, now: DateTime<Utc>) -> Vec<SettlementBatch> {
        let nonce = self.nonces.next(now);

        let mut batches: Vec<SettlementBatch> = stream::iter(users)
            .map(|group| async move {
                let user = group.user.clone();
                match self.sign_records(&group.user, group.address, group.records, nonce).await {
                    Ok(batch) => Some(batch),
                    Err(e) => {
                        warn!("⚠️  TEE signing failed for {}, skipping this round: {}", user, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|batch| async move { batch })
            .collect()
            .await;

        batches.sort_by(|a, b| a.user.cmp(&b.user));
        debug!("📦 Built {} signed batches (nonce {})", batches.len(), nonce);
        batches
    }

    /// Hash and sign an ordered record set. Used again after adjustment.
    pub async fn sign_records(
        &self,
        user: &str,
        address: Address,
        records: Vec<PricedRecord>,
        nonce: U256,
    ) -> AppResult<SettlementBatch> {
        if records.is_empty() {
            return Err(SettlementError::EmptyBatch {
                user: user.to_string(),
            }
            .into());
        }
        let total_fee = records
            .iter()
            .fold(U256::ZERO, |acc, r| acc.saturating_add(r.fee));
        let requests_hash = requests_hash(&records);
        let message_hash = message_hash(requests_hash, nonce, self.provider, address, total_fee);
        let signature = self.signer.sign(message_hash).await?;

        Ok(SettlementBatch {
            user: user.to_string(),
            records,
            message_hash,
            settlement: TEESettlementData {
                user: address,
                provider: self.provider,
                totalFee: total_fee,
                requestsHash: requests_hash,
                nonce,
                signature,
            },
        })
    }
}
