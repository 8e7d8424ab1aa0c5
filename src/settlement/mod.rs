// Fee settlement reconciliation: ledger records are bundled per user, previewed
// against the escrow contract, trimmed to what the chain will pay, submitted,
// and reconciled back into the ledger.
pub mod accounts;
pub mod adjuster;
pub mod builder;
pub mod driver;
pub mod executor;
pub mod preview;
pub mod reconciler;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod test_support;

use std::fmt;

use alloy_primitives::{Address, B256, U256};
use serde::Serialize;

use crate::execution::TEESettlementData;
use crate::ledger::models::PendingUsageRecord;

pub use driver::{EngineConfig, SettlementEngine};

/// Per-user result reported by the escrow contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SettlementStatus {
    Success,
    Partial,
    ProviderMismatch,
    NoTeeSigner,
    InvalidNonce,
    InvalidSignature,
}

impl SettlementStatus {
    /// Failures that no retry can fix under the current on-chain state.
    pub fn is_permanent(&self) -> bool {
        match self {
            SettlementStatus::NoTeeSigner | SettlementStatus::ProviderMismatch => true,
            SettlementStatus::Success
            | SettlementStatus::Partial
            | SettlementStatus::InvalidNonce
            | SettlementStatus::InvalidSignature => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Success => "SUCCESS",
            SettlementStatus::Partial => "PARTIAL",
            SettlementStatus::ProviderMismatch => "PROVIDER_MISMATCH",
            SettlementStatus::NoTeeSigner => "NO_TEE_SIGNER",
            SettlementStatus::InvalidNonce => "INVALID_NONCE",
            SettlementStatus::InvalidSignature => "INVALID_SIGNATURE",
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for SettlementStatus {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(SettlementStatus::Success),
            1 => Ok(SettlementStatus::Partial),
            2 => Ok(SettlementStatus::ProviderMismatch),
            3 => Ok(SettlementStatus::NoTeeSigner),
            4 => Ok(SettlementStatus::InvalidNonce),
            5 => Ok(SettlementStatus::InvalidSignature),
            other => Err(other),
        }
    }
}

/// A ledger record with its parsed fee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedRecord {
    pub record: PendingUsageRecord,
    pub fee: U256,
}

/// One user's eligible records for a round, oldest first.
#[derive(Debug, Clone)]
pub struct UserRequests {
    pub user: String,
    pub address: Address,
    pub records: Vec<PricedRecord>,
}

impl UserRequests {
    pub fn total_fee(&self) -> U256 {
        self.records
            .iter()
            .fold(U256::ZERO, |acc, r| acc.saturating_add(r.fee))
    }
}

/// Signed per-user settlement, valid only for its exact record set.
#[derive(Debug, Clone)]
pub struct SettlementBatch {
    pub user: String,
    pub records: Vec<PricedRecord>,
    pub message_hash: B256,
    pub settlement: TEESettlementData,
}

impl SettlementBatch {
    pub fn address(&self) -> Address {
        self.settlement.user
    }

    pub fn total_fee(&self) -> U256 {
        self.settlement.totalFee
    }

    pub fn nonce(&self) -> U256 {
        self.settlement.nonce
    }

    pub fn request_hashes(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|r| r.record.request_hash.clone())
            .collect()
    }
}

/// Preview or execution verdict for one user's batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    pub status: SettlementStatus,
    pub unsettled_amount: U256,
}

impl SettlementOutcome {
    pub fn success() -> Self {
        Self {
            status: SettlementStatus::Success,
            unsettled_amount: U256::ZERO,
        }
    }

    /// Nothing assumed payable.
    pub fn conservative(total_fee: U256) -> Self {
        Self {
            status: SettlementStatus::Partial,
            unsettled_amount: total_fee,
        }
    }
}
