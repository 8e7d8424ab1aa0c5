use std::str::FromStr;

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

use crate::error::LedgerError;

/// One metered request awaiting settlement.
///
/// Fee fields are kept exactly as the proxy wrote them: their string bytes
/// feed the requests hash, so they are never re-formatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PendingUsageRecord {
    pub request_hash: String,
    pub user_address: String,
    /// Caller-supplied per-request sequence, informational only
    pub nonce: String,
    pub input_fee: String,
    pub output_fee: String,
    pub fee: String,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub skip_until: Option<DateTime<Utc>>,
}

impl PendingUsageRecord {
    pub fn fee_amount(&self) -> Result<U256, LedgerError> {
        parse_amount("fee", &self.fee)
    }

    /// Output metering is finished once a non-zero output fee is written.
    pub fn has_output_fee(&self) -> bool {
        matches!(parse_amount("output_fee", &self.output_fee), Ok(v) if !v.is_zero())
    }

    pub fn is_skipped(&self, now: DateTime<Utc>) -> bool {
        matches!(self.skip_until, Some(until) if until > now)
    }

    /// Mirrors the SQL eligibility predicate used by the Postgres store.
    pub fn is_eligible(&self, filter: &RecordFilter) -> bool {
        !self.processed
            && !self.is_skipped(filter.as_of)
            && (self.has_output_fee() || self.created_at <= filter.old_request_cutoff)
            && filter
                .user
                .as_ref()
                .map_or(true, |user| user == &self.user_address)
    }
}

/// Local mirror of one user's on-chain escrow state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct LedgerAccount {
    pub user_address: String,
    pub lock_balance: String,
    pub unsettled_fee: String,
    pub last_balance_check_time: Option<DateTime<Utc>>,
    pub signer: Vec<String>,
    pub skip_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerAccount {
    pub fn lock_balance_amount(&self) -> Result<U256, LedgerError> {
        parse_amount("lock_balance", &self.lock_balance)
    }

    pub fn unsettled_fee_amount(&self) -> Result<U256, LedgerError> {
        parse_amount("unsettled_fee", &self.unsettled_fee)
    }

    /// Same predicate as the SQL in `list_accounts_at_risk`.
    pub fn is_at_risk(&self, filter: &AccountRiskFilter) -> Result<bool, LedgerError> {
        let unsettled = self.unsettled_fee_amount()?;
        if unsettled.is_zero() {
            return Ok(false);
        }
        let lock = self.lock_balance_amount()?;
        // lock - unsettled < threshold, without underflow
        let short = lock < unsettled.saturating_add(filter.lock_balance_threshold);
        let stale = match (filter.stale_before, self.last_balance_check_time) {
            (Some(_), None) => true,
            (Some(cutoff), Some(checked)) => checked < cutoff,
            (None, _) => false,
        };
        Ok(short || stale)
    }
}

/// Chain-side view of an account, ready to be written to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncedAccount {
    pub user_address: String,
    pub lock_balance: U256,
    pub signer: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
}

/// Selection of records a settlement round may consider.
#[derive(Debug, Clone)]
pub struct RecordFilter {
    pub as_of: DateTime<Utc>,
    /// Records without an output fee become eligible once created before this
    pub old_request_cutoff: DateTime<Utc>,
    pub user: Option<String>,
}

impl RecordFilter {
    pub fn eligible_at(now: DateTime<Utc>, old_request_threshold: Duration) -> Self {
        Self {
            as_of: now,
            old_request_cutoff: now - old_request_threshold,
            user: None,
        }
    }
}

/// Accounts whose projected balance is close to insolvency.
#[derive(Debug, Clone)]
pub struct AccountRiskFilter {
    pub lock_balance_threshold: U256,
    /// When set, accounts not checked since this instant also qualify
    pub stale_before: Option<DateTime<Utc>>,
}

/// Journal entry written before a settlement transaction is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct InFlightSettlement {
    pub user_address: String,
    /// Settlement nonce, decimal
    pub nonce: String,
    pub total_fee: String,
    pub request_hashes: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl InFlightSettlement {
    pub fn nonce_value(&self) -> Result<U256, LedgerError> {
        parse_amount("nonce", &self.nonce)
    }

    pub fn is_expired(&self, now: DateTime<Utc>, expiry: Duration) -> bool {
        self.created_at + expiry <= now
    }
}

/// A record removed by a permanent-failure purge, kept for manual reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct DeadLetterRecord {
    pub request_hash: String,
    pub user_address: String,
    pub nonce: String,
    pub input_fee: String,
    pub output_fee: String,
    pub fee: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_record(record: &PendingUsageRecord, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            request_hash: record.request_hash.clone(),
            user_address: record.user_address.clone(),
            nonce: record.nonce.clone(),
            input_fee: record.input_fee.clone(),
            output_fee: record.output_fee.clone(),
            fee: record.fee.clone(),
            created_at: record.created_at,
            reason: reason.to_string(),
            dead_lettered_at: at,
        }
    }
}

/// Per-user pending totals for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingUserSummary {
    pub user_address: String,
    pub records: usize,
    pub skipped: usize,
    pub total_fee: String,
}

/// Parse a monetary field. Accepts decimal or `0x` hex, empty is rejected.
pub fn parse_amount(field: &str, value: &str) -> Result<U256, LedgerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidAmount {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
    U256::from_str(trimmed).map_err(|_| LedgerError::InvalidAmount {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Canonical (checksummed) form used as the ledger's user key.
pub fn normalize_address(value: &str) -> Option<String> {
    Address::from_str(value.trim())
        .ok()
        .map(|address| address.to_checksum(None))
}
