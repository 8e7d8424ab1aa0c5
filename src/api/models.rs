use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::ledger::models::{parse_amount, LedgerAccount, PendingUserSummary, PendingUsageRecord};

// ========== REQUEST MODELS ==========

/// One metered request reported by the serving proxy
#[derive(Debug, Deserialize, Validate)]
pub struct IngestRecordRequest {
    #[validate(length(min = 1, max = 256))]
    pub request_hash: String,

    #[validate(length(equal = 42))]
    pub user_address: String,

    /// Caller-side request sequence
    #[validate(length(min = 1, max = 78))]
    pub nonce: String,

    #[validate(custom = "validate_amount")]
    pub input_fee: String,

    #[validate(custom = "validate_amount")]
    pub output_fee: String,

    #[validate(custom = "validate_amount")]
    pub fee: String,

    /// Defaults to the time of ingestion
    pub created_at: Option<DateTime<Utc>>,
}

impl IngestRecordRequest {
    /// Fee strings are stored verbatim; the user key is the normalized address.
    pub fn into_record(self, user_address: String, now: DateTime<Utc>) -> PendingUsageRecord {
        PendingUsageRecord {
            request_hash: self.request_hash,
            user_address,
            nonce: self.nonce,
            input_fee: self.input_fee,
            output_fee: self.output_fee,
            fee: self.fee,
            created_at: self.created_at.unwrap_or(now),
            processed: false,
            skip_until: None,
        }
    }
}

fn validate_amount(value: &str) -> Result<(), ValidationError> {
    parse_amount("fee", value)
        .map(|_| ())
        .map_err(|_| ValidationError::new("invalid_amount"))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub user: Option<String>,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub eligible_records: u64,
    pub inflight_settlements: usize,
}

#[derive(Debug, Serialize)]
pub struct IngestRecordResponse {
    pub request_hash: String,
    pub user_address: String,
    pub accepted_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub total_records: usize,
    pub users: Vec<PendingUserSummary>,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub user_address: String,
    pub lock_balance: String,
    pub unsettled_fee: String,
    pub last_balance_check_time: Option<DateTime<Utc>>,
    pub signer: Vec<String>,
}

impl From<LedgerAccount> for AccountResponse {
    fn from(account: LedgerAccount) -> Self {
        Self {
            user_address: account.user_address,
            lock_balance: account.lock_balance,
            unsettled_fee: account.unsettled_fee,
            last_balance_check_time: account.last_balance_check_time,
            signer: account.signer,
        }
    }
}
