use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::*;
use crate::config::PurgePolicy;
use crate::error::AppResult;

/// Persistence seam for the settlement engine.
///
/// Every method is a single atomic unit: implementations must not leave a
/// half-applied change visible when they return an error.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== RECORD OPERATIONS ==========

    /// Store a metered record and add its fee to the user's unsettled aggregate.
    async fn insert_record(&self, record: &PendingUsageRecord) -> AppResult<()>;

    /// Eligible records, oldest first (`created_at`, then `request_hash`).
    async fn list_eligible_records(&self, filter: &RecordFilter)
        -> AppResult<Vec<PendingUsageRecord>>;

    async fn count_eligible_records(&self, filter: &RecordFilter) -> AppResult<u64>;

    /// Every unprocessed record, skipped ones included.
    async fn list_unprocessed_records(&self) -> AppResult<Vec<PendingUsageRecord>>;

    async fn update_skip_until(&self, request_hashes: &[String], until: DateTime<Utc>)
        -> AppResult<u64>;

    /// Clear elapsed skip-until marks on records and accounts.
    async fn clear_expired_skip_until(&self, now: DateTime<Utc>) -> AppResult<u64>;

    /// Mark processed, then delete. The only path that removes settled rows.
    async fn delete_settled_records(&self, request_hashes: &[String]) -> AppResult<u64>;

    /// Remove every pending record of `user`, dead-lettering them first unless
    /// the policy forgives the debt.
    async fn purge_user_records(
        &self,
        user: &str,
        reason: &str,
        policy: PurgePolicy,
        at: DateTime<Utc>,
    ) -> AppResult<u64>;

    async fn list_dead_letters(&self, user: Option<&str>) -> AppResult<Vec<DeadLetterRecord>>;

    async fn reset_unsettled_fees(&self) -> AppResult<u64>;

    // ========== ACCOUNT OPERATIONS ==========

    async fn get_account(&self, user: &str) -> AppResult<Option<LedgerAccount>>;

    async fn upsert_account(&self, account: &SyncedAccount, at: DateTime<Utc>)
        -> AppResult<LedgerAccount>;

    /// Add, update and remove local accounts so they match `accounts`.
    async fn sync_accounts(&self, accounts: &[SyncedAccount], at: DateTime<Utc>)
        -> AppResult<SyncStats>;

    async fn list_accounts_at_risk(&self, filter: &AccountRiskFilter)
        -> AppResult<Vec<LedgerAccount>>;

    // ========== IN-FLIGHT JOURNAL ==========

    async fn record_inflight(&self, entries: &[InFlightSettlement]) -> AppResult<()>;

    async fn list_inflight(&self) -> AppResult<Vec<InFlightSettlement>>;

    async fn clear_inflight(&self, users: &[String]) -> AppResult<u64>;
}

/// Sum of fees for operator views. Unparsable fees are counted as zero.
pub fn summarize_pending(
    records: &[PendingUsageRecord],
    now: DateTime<Utc>,
) -> Vec<PendingUserSummary> {
    let mut by_user: std::collections::BTreeMap<&str, (usize, usize, U256)> =
        std::collections::BTreeMap::new();

    for record in records {
        let entry = by_user
            .entry(record.user_address.as_str())
            .or_insert((0, 0, U256::ZERO));
        entry.0 += 1;
        if record.is_skipped(now) {
            entry.1 += 1;
        }
        entry.2 = entry.2.saturating_add(record.fee_amount().unwrap_or_default());
    }

    by_user
        .into_iter()
        .map(|(user, (records, skipped, total))| PendingUserSummary {
            user_address: user.to_string(),
            records,
            skipped,
            total_fee: total.to_string(),
        })
        .collect()
}
