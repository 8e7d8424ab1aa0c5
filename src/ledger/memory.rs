use std::collections::{BTreeMap, HashMap, HashSet};

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::models::*;
use super::store::LedgerStore;
use crate::config::PurgePolicy;
use crate::error::{AppError, AppResult, LedgerError};

#[derive(Default)]
struct MemoryState {
    records: BTreeMap<String, PendingUsageRecord>,
    accounts: BTreeMap<String, LedgerAccount>,
    inflight: HashMap<String, InFlightSettlement>,
    dead_letters: Vec<DeadLetterRecord>,
}

/// Process-local ledger for development and tests.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<MemoryState>,
    fail_writes: Mutex<bool>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every mutating call fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    fn check_writable(&self) -> AppResult<()> {
        if *self.fail_writes.lock() {
            return Err(AppError::Internal("ledger write failure".into()));
        }
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn record(&self, request_hash: &str) -> Option<PendingUsageRecord> {
        self.state.lock().records.get(request_hash).cloned()
    }

    fn blank_account(user: &str, now: DateTime<Utc>) -> LedgerAccount {
        LedgerAccount {
            user_address: user.to_string(),
            lock_balance: "0".into(),
            unsettled_fee: "0".into(),
            last_balance_check_time: None,
            signer: Vec::new(),
            skip_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply_sync(state: &mut MemoryState, account: &SyncedAccount, at: DateTime<Utc>) -> bool {
        let existed = state.accounts.contains_key(&account.user_address);
        let entry = state
            .accounts
            .entry(account.user_address.clone())
            .or_insert_with(|| Self::blank_account(&account.user_address, at));
        entry.lock_balance = account.lock_balance.to_string();
        entry.signer = account.signer.clone();
        entry.last_balance_check_time = Some(at);
        entry.updated_at = at;
        existed
    }
}

fn sort_oldest_first(records: &mut [PendingUsageRecord]) {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.request_hash.cmp(&b.request_hash))
    });
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn insert_record(&self, record: &PendingUsageRecord) -> AppResult<()> {
        self.check_writable()?;
        let fee = record.fee_amount()?;
        let now = Utc::now();
        let mut state = self.state.lock();

        if state.records.contains_key(&record.request_hash) {
            return Err(LedgerError::DuplicateRecord(record.request_hash.clone()).into());
        }

        let account = state
            .accounts
            .entry(record.user_address.clone())
            .or_insert_with(|| Self::blank_account(&record.user_address, now));
        let unsettled = account.unsettled_fee_amount()?;
        account.unsettled_fee = unsettled.saturating_add(fee).to_string();
        account.updated_at = now;

        let mut stored = record.clone();
        stored.processed = false;
        stored.skip_until = None;
        state.records.insert(stored.request_hash.clone(), stored);
        Ok(())
    }

    async fn list_eligible_records(
        &self,
        filter: &RecordFilter,
    ) -> AppResult<Vec<PendingUsageRecord>> {
        let state = self.state.lock();
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| r.is_eligible(filter))
            .cloned()
            .collect();
        sort_oldest_first(&mut records);
        Ok(records)
    }

    async fn count_eligible_records(&self, filter: &RecordFilter) -> AppResult<u64> {
        let state = self.state.lock();
        Ok(state.records.values().filter(|r| r.is_eligible(filter)).count() as u64)
    }

    async fn list_unprocessed_records(&self) -> AppResult<Vec<PendingUsageRecord>> {
        let state = self.state.lock();
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| !r.processed)
            .cloned()
            .collect();
        sort_oldest_first(&mut records);
        Ok(records)
    }

    async fn update_skip_until(
        &self,
        request_hashes: &[String],
        until: DateTime<Utc>,
    ) -> AppResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let mut updated = 0;
        for hash in request_hashes {
            if let Some(record) = state.records.get_mut(hash) {
                record.skip_until = Some(until);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn clear_expired_skip_until(&self, now: DateTime<Utc>) -> AppResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let mut cleared = 0;
        for record in state.records.values_mut() {
            if matches!(record.skip_until, Some(until) if until <= now) {
                record.skip_until = None;
                cleared += 1;
            }
        }
        for account in state.accounts.values_mut() {
            if matches!(account.skip_until, Some(until) if until <= now) {
                account.skip_until = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn delete_settled_records(&self, request_hashes: &[String]) -> AppResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let mut deleted = 0;
        for hash in request_hashes {
            if let Some(record) = state.records.get_mut(hash) {
                record.processed = true;
            }
            if state.records.remove(hash).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn purge_user_records(
        &self,
        user: &str,
        reason: &str,
        policy: PurgePolicy,
        at: DateTime<Utc>,
    ) -> AppResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let hashes: Vec<String> = state
            .records
            .values()
            .filter(|r| r.user_address == user)
            .map(|r| r.request_hash.clone())
            .collect();

        for hash in &hashes {
            if let Some(record) = state.records.remove(hash) {
                if policy == PurgePolicy::DeadLetter
                    && !state.dead_letters.iter().any(|d| &d.request_hash == hash)
                {
                    state
                        .dead_letters
                        .push(DeadLetterRecord::from_record(&record, reason, at));
                }
            }
        }
        Ok(hashes.len() as u64)
    }

    async fn list_dead_letters(&self, user: Option<&str>) -> AppResult<Vec<DeadLetterRecord>> {
        let state = self.state.lock();
        Ok(state
            .dead_letters
            .iter()
            .filter(|d| user.map_or(true, |u| d.user_address == u))
            .cloned()
            .collect())
    }

    async fn reset_unsettled_fees(&self) -> AppResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let mut reset = 0;
        for account in state.accounts.values_mut() {
            if account.unsettled_fee_amount().map_or(true, |fee| fee != U256::ZERO) {
                account.unsettled_fee = "0".into();
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn get_account(&self, user: &str) -> AppResult<Option<LedgerAccount>> {
        Ok(self.state.lock().accounts.get(user).cloned())
    }

    async fn upsert_account(
        &self,
        account: &SyncedAccount,
        at: DateTime<Utc>,
    ) -> AppResult<LedgerAccount> {
        self.check_writable()?;
        let mut state = self.state.lock();
        Self::apply_sync(&mut state, account, at);
        state
            .accounts
            .get(&account.user_address)
            .cloned()
            .ok_or_else(|| AppError::Internal("account vanished after upsert".into()))
    }

    async fn sync_accounts(
        &self,
        accounts: &[SyncedAccount],
        at: DateTime<Utc>,
    ) -> AppResult<SyncStats> {
        self.check_writable()?;
        let mut state = self.state.lock();
        let mut stats = SyncStats::default();

        for account in accounts {
            if Self::apply_sync(&mut state, account, at) {
                stats.updated += 1;
            } else {
                stats.added += 1;
            }
        }

        let keep: HashSet<&str> = accounts.iter().map(|a| a.user_address.as_str()).collect();
        let before = state.accounts.len();
        state.accounts.retain(|user, _| keep.contains(user.as_str()));
        stats.removed = (before - state.accounts.len()) as u64;
        Ok(stats)
    }

    async fn list_accounts_at_risk(
        &self,
        filter: &AccountRiskFilter,
    ) -> AppResult<Vec<LedgerAccount>> {
        let state = self.state.lock();
        let mut at_risk = Vec::new();
        for account in state.accounts.values() {
            if account.is_at_risk(filter)? {
                at_risk.push(account.clone());
            }
        }
        Ok(at_risk)
    }

    async fn record_inflight(&self, entries: &[InFlightSettlement]) -> AppResult<()> {
        self.check_writable()?;
        let mut state = self.state.lock();
        for entry in entries {
            state.inflight.insert(entry.user_address.clone(), entry.clone());
        }
        Ok(())
    }

    async fn list_inflight(&self) -> AppResult<Vec<InFlightSettlement>> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.inflight.values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(entries)
    }

    async fn clear_inflight(&self, users: &[String]) -> AppResult<u64> {
        self.check_writable()?;
        let mut state = self.state.lock();
        Ok(users
            .iter()
            .filter(|u| state.inflight.remove(u.as_str()).is_some())
            .count() as u64)
    }
}
