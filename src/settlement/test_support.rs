//! Scripted collaborators for settlement tests.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use alloy_primitives::{eip191_hash_message, keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use parking_lot::Mutex;
use tokio::sync::watch;

use super::accounts::{AccountCache, AccountSync};
use super::adjuster::SettlementAdjuster;
use super::builder::{group_by_user, message_hash, BatchBuilder};
use super::executor::SettlementExecutor;
use super::preview::SettlementPreviewer;
use super::{EngineConfig, PricedRecord, SettlementBatch, SettlementEngine, SettlementStatus};
use crate::error::{ChainError, SignerError};
use crate::execution::contract::{
    ChainAccount, PreviewReport, SettleReceipt, SettlementContract, SettlementEvent,
};
use crate::execution::{LocalTeeSigner, TEESettlementData, TeeSigner};
use crate::ledger::models::{PendingUsageRecord, RecordFilter};
use crate::ledger::{InMemoryLedger, LedgerStore};

pub const USER_A: &str = "0x1000000000000000000000000000000000000001";
pub const USER_B: &str = "0x2000000000000000000000000000000000000002";
pub const USER_C: &str = "0x3000000000000000000000000000000000000003";

pub const DEV_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe512961708279b7e1a8d7d7a3c2b9e3";

pub fn provider() -> Address {
    Address::repeat_byte(0x0f)
}

pub fn address(user: &str) -> Address {
    Address::from_str(user).unwrap()
}

/// Fully metered record (`output_fee == fee`).
pub fn record_at(user: &str, hash: &str, fee: &str, created_at: DateTime<Utc>) -> PendingUsageRecord {
    PendingUsageRecord {
        request_hash: hash.into(),
        user_address: user.into(),
        nonce: "1".into(),
        input_fee: "0".into(),
        output_fee: fee.into(),
        fee: fee.into(),
        created_at,
        processed: false,
        skip_until: None,
    }
}

pub fn priced(user: &str, hash: &str, fee: &str, now: DateTime<Utc>) -> PricedRecord {
    let record = record_at(user, hash, fee, now);
    let fee = record.fee_amount().unwrap();
    PricedRecord { record, fee }
}

// ========== SIGNER ==========

/// Local signer that refuses the message hashes it was told to refuse.
pub struct FlakySigner {
    inner: LocalTeeSigner,
    refused: Mutex<HashSet<B256>>,
}

impl FlakySigner {
    pub fn new() -> Self {
        Self {
            inner: LocalTeeSigner::from_hex(DEV_KEY).unwrap(),
            refused: Mutex::new(HashSet::new()),
        }
    }

    pub fn refuse(&self, message_hash: B256) {
        self.refused.lock().insert(message_hash);
    }
}

#[async_trait]
impl TeeSigner for FlakySigner {
    async fn sign(&self, message_hash: B256) -> Result<Bytes, SignerError> {
        if self.refused.lock().contains(&message_hash) {
            return Err(SignerError::Remote("enclave unavailable".into()));
        }
        self.inner.sign(message_hash).await
    }
}

// ========== CONTRACT ==========

#[derive(Debug, Clone, Default)]
struct MockAccount {
    balance: U256,
    pending_refund: U256,
    nonce: U256,
    acknowledged: bool,
}

#[derive(Default)]
struct MockState {
    accounts: BTreeMap<Address, MockAccount>,
    failing_previews: HashSet<Address>,
    rejected_on_settle: HashSet<Address>,
    failing_settles: usize,
    lose_next_receipt: bool,
    /// Broadcast but not yet mined
    mempool: Vec<Vec<TEESettlementData>>,
    nonce_reads_left: Option<usize>,
    settle_calls: usize,
    preview_calls: usize,
    lock_time: u64,
}

enum Verdict {
    Payable,
    Partial(U256),
    Failed(SettlementStatus),
}

/// In-memory escrow contract mirroring the on-chain settlement rules.
pub struct MockContract {
    provider: Address,
    tee_signer: Address,
    state: Mutex<MockState>,
}

impl MockContract {
    pub fn new(provider: Address, tee_signer: Address) -> Self {
        Self {
            provider,
            tee_signer,
            state: Mutex::new(MockState {
                lock_time: 86_400,
                ..Default::default()
            }),
        }
    }

    /// Acknowledged account with `balance` and no pending refund.
    pub fn fund(&self, user: &str, balance: u64) {
        let mut state = self.state.lock();
        let account = state.accounts.entry(address(user)).or_default();
        account.balance = U256::from(balance);
        account.acknowledged = true;
    }

    pub fn set_pending_refund(&self, user: &str, amount: u64) {
        let mut state = self.state.lock();
        state.accounts.entry(address(user)).or_default().pending_refund = U256::from(amount);
    }

    pub fn revoke_signer(&self, user: &str) {
        let mut state = self.state.lock();
        state.accounts.entry(address(user)).or_default().acknowledged = false;
    }

    pub fn set_lock_time(&self, secs: u64) {
        self.state.lock().lock_time = secs;
    }

    pub fn fail_preview_for(&self, user: &str) {
        self.state.lock().failing_previews.insert(address(user));
    }

    pub fn clear_preview_failures(&self) {
        self.state.lock().failing_previews.clear();
    }

    /// Settlement of `user` is refused at execution time.
    pub fn reject_on_settle(&self, user: &str) {
        self.state.lock().rejected_on_settle.insert(address(user));
    }

    /// The next `n` settle transactions are rejected by the node.
    pub fn fail_next_settles(&self, n: usize) {
        self.state.lock().failing_settles = n;
    }

    /// The next settle transaction is broadcast but its receipt never
    /// arrives; it stays unmined until `mine_pending` or the next send.
    pub fn lose_next_receipt(&self) {
        self.state.lock().lose_next_receipt = true;
    }

    pub fn mine_pending(&self) {
        let mut state = self.state.lock();
        self.mine(&mut state);
    }

    fn mine(&self, state: &mut MockState) {
        for settlements in std::mem::take(&mut state.mempool) {
            self.apply(state, &settlements);
        }
    }

    /// Allow `n` more account reads, then fail every one after.
    pub fn fail_nonce_reads_after(&self, n: usize) {
        self.state.lock().nonce_reads_left = Some(n);
    }

    pub fn settle_calls(&self) -> usize {
        self.state.lock().settle_calls
    }

    pub fn preview_calls(&self) -> usize {
        self.state.lock().preview_calls
    }

    pub fn balance(&self, user: &str) -> U256 {
        self.state
            .lock()
            .accounts
            .get(&address(user))
            .map(|a| a.balance)
            .unwrap_or_default()
    }

    pub fn nonce(&self, user: &str) -> U256 {
        self.state
            .lock()
            .accounts
            .get(&address(user))
            .map(|a| a.nonce)
            .unwrap_or_default()
    }

    pub fn signature_is_valid(&self, settlement: &TEESettlementData) -> bool {
        let signature = settlement.signature.as_ref();
        if signature.len() != 65 || signature[64] < 27 {
            return false;
        }
        let digest = eip191_hash_message(message_hash(
            settlement.requestsHash,
            settlement.nonce,
            settlement.provider,
            settlement.user,
            settlement.totalFee,
        ));
        let Ok(sig) = Signature::from_slice(&signature[..64]) else {
            return false;
        };
        let Some(recid) = RecoveryId::from_byte(signature[64] - 27) else {
            return false;
        };
        VerifyingKey::recover_from_prehash(digest.as_slice(), &sig, recid)
            .map(|key| Address::from_public_key(&key) == self.tee_signer)
            .unwrap_or(false)
    }

    fn evaluate(&self, state: &MockState, settlement: &TEESettlementData) -> Verdict {
        if settlement.provider != self.provider {
            return Verdict::Failed(SettlementStatus::ProviderMismatch);
        }
        let Some(account) = state.accounts.get(&settlement.user).filter(|a| a.acknowledged) else {
            return Verdict::Failed(SettlementStatus::NoTeeSigner);
        };
        if settlement.nonce <= account.nonce {
            return Verdict::Failed(SettlementStatus::InvalidNonce);
        }
        if !self.signature_is_valid(settlement) {
            return Verdict::Failed(SettlementStatus::InvalidSignature);
        }
        let lock = account.balance.saturating_sub(account.pending_refund);
        if settlement.totalFee > lock {
            return Verdict::Partial(settlement.totalFee - lock);
        }
        Verdict::Payable
    }

    fn apply(&self, state: &mut MockState, settlements: &[TEESettlementData]) -> Vec<SettlementEvent> {
        let mut events = Vec::with_capacity(settlements.len());
        for settlement in settlements {
            let verdict = if state.rejected_on_settle.contains(&settlement.user) {
                Verdict::Failed(SettlementStatus::InvalidSignature)
            } else {
                self.evaluate(state, settlement)
            };
            let (status, unsettled_amount) = match verdict {
                Verdict::Payable => {
                    if let Some(account) = state.accounts.get_mut(&settlement.user) {
                        account.balance -= settlement.totalFee;
                        account.nonce = settlement.nonce;
                    }
                    (SettlementStatus::Success, U256::ZERO)
                }
                Verdict::Partial(unsettled) => (SettlementStatus::Partial, unsettled),
                Verdict::Failed(status) => (status, settlement.totalFee),
            };
            events.push(SettlementEvent {
                user: settlement.user,
                status: status as u8,
                unsettled_amount,
            });
        }

        events
    }

    fn chain_account(user: Address, account: &MockAccount) -> ChainAccount {
        let signer = if account.acknowledged {
            [U256::from(1u8), U256::from(2u8)]
        } else {
            [U256::ZERO, U256::ZERO]
        };
        ChainAccount {
            user,
            nonce: account.nonce,
            balance: account.balance,
            pending_refund: account.pending_refund,
            signer,
            acknowledged: account.acknowledged,
        }
    }
}

#[async_trait]
impl SettlementContract for MockContract {
    fn provider_address(&self) -> Address {
        self.provider
    }

    async fn preview_settlements(
        &self,
        settlements: &[TEESettlementData],
    ) -> Result<PreviewReport, ChainError> {
        let mut state = self.state.lock();
        state.preview_calls += 1;
        if settlements.iter().any(|s| state.failing_previews.contains(&s.user)) {
            return Err(ChainError::Transport("preview call dropped".into()));
        }

        let mut report = PreviewReport::default();
        for settlement in settlements {
            match self.evaluate(&state, settlement) {
                Verdict::Payable => {}
                Verdict::Partial(unsettled) => report.partial.push((settlement.user, unsettled)),
                Verdict::Failed(status) => report.failed.push((settlement.user, status as u8)),
            }
        }
        Ok(report)
    }

    async fn settle_fees(
        &self,
        settlements: &[TEESettlementData],
    ) -> Result<SettleReceipt, ChainError> {
        let mut state = self.state.lock();
        state.settle_calls += 1;
        if state.failing_settles > 0 {
            state.failing_settles -= 1;
            return Err(ChainError::Rpc {
                code: -32000,
                message: "insufficient funds for gas".into(),
            });
        }
        // Same sender: earlier transactions mine first
        self.mine(&mut state);

        let tx_hash = keccak256(state.settle_calls.to_be_bytes());
        if std::mem::take(&mut state.lose_next_receipt) {
            state.mempool.push(settlements.to_vec());
            return Err(ChainError::unconfirmed(
                Some(tx_hash),
                ChainError::ReceiptNotFound { tx_hash, rounds: 10 },
            ));
        }

        let events = self.apply(&mut state, settlements);
        Ok(SettleReceipt { tx_hash, events })
    }

    async fn get_account(&self, user: Address) -> Result<Option<ChainAccount>, ChainError> {
        let mut state = self.state.lock();
        if let Some(left) = state.nonce_reads_left.as_mut() {
            if *left == 0 {
                return Err(ChainError::Transport("connection reset".into()));
            }
            *left -= 1;
        }
        Ok(state
            .accounts
            .get(&user)
            .map(|account| Self::chain_account(user, account)))
    }

    async fn list_accounts(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ChainAccount>, u64), ChainError> {
        let state = self.state.lock();
        let page = state
            .accounts
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(user, account)| Self::chain_account(*user, account))
            .collect();
        Ok((page, state.accounts.len() as u64))
    }

    async fn lock_time(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().lock_time)
    }
}

/// Delays every preview and records the highest overlap seen.
pub struct SlowPreviews {
    inner: Arc<MockContract>,
    delay: std::time::Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowPreviews {
    pub fn new(inner: Arc<MockContract>, delay_ms: u64) -> Self {
        Self {
            inner,
            delay: std::time::Duration::from_millis(delay_ms),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SettlementContract for SlowPreviews {
    fn provider_address(&self) -> Address {
        self.inner.provider_address()
    }

    async fn preview_settlements(
        &self,
        settlements: &[TEESettlementData],
    ) -> Result<PreviewReport, ChainError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.inner.preview_settlements(settlements).await
    }

    async fn settle_fees(
        &self,
        settlements: &[TEESettlementData],
    ) -> Result<SettleReceipt, ChainError> {
        self.inner.settle_fees(settlements).await
    }

    async fn get_account(&self, user: Address) -> Result<Option<ChainAccount>, ChainError> {
        self.inner.get_account(user).await
    }

    async fn list_accounts(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ChainAccount>, u64), ChainError> {
        self.inner.list_accounts(offset, limit).await
    }

    async fn lock_time(&self) -> Result<u64, ChainError> {
        self.inner.lock_time().await
    }
}

// ========== HARNESS ==========

pub struct Harness {
    pub ledger: Arc<InMemoryLedger>,
    pub contract: Arc<MockContract>,
    pub signer: Arc<FlakySigner>,
    pub builder: Arc<BatchBuilder>,
    pub chunk_size: usize,
}

impl Harness {
    pub fn new(chunk_size: usize) -> Self {
        let signer = Arc::new(FlakySigner::new());
        let tee = LocalTeeSigner::from_hex(DEV_KEY).unwrap().address();
        let contract = Arc::new(MockContract::new(provider(), tee));
        let builder = Arc::new(BatchBuilder::new(signer.clone(), provider(), 4));

        Self {
            ledger: Arc::new(InMemoryLedger::new()),
            contract,
            signer,
            builder,
            chunk_size,
        }
    }

    pub fn fund(&self, user: &str, balance: u64) {
        self.contract.fund(user, balance);
    }

    /// Insert a record created `age_secs` ago.
    pub async fn insert(&self, user: &str, hash: &str, fee: &str, age_secs: i64) {
        let created_at = Utc::now() - Duration::seconds(age_secs);
        self.ledger
            .insert_record(&record_at(user, hash, fee, created_at))
            .await
            .unwrap();
    }

    pub async fn build_batches(&self, now: DateTime<Utc>) -> Vec<SettlementBatch> {
        let filter = RecordFilter::eligible_at(now, Duration::seconds(600));
        let records = self.ledger.list_eligible_records(&filter).await.unwrap();
        self.builder.build(group_by_user(records).users, now).await
    }

    pub fn previewer(&self) -> SettlementPreviewer {
        SettlementPreviewer::new(self.contract.clone(), self.chunk_size, 2)
    }

    pub fn adjuster(&self) -> SettlementAdjuster {
        SettlementAdjuster::new(self.builder.clone(), self.ledger.clone(), Duration::seconds(300))
    }

    pub fn executor(&self) -> SettlementExecutor {
        SettlementExecutor::new(self.contract.clone(), self.ledger.clone(), self.chunk_size)
    }

    pub fn accounts(&self) -> Arc<AccountSync> {
        Arc::new(AccountSync::new(
            self.contract.clone(),
            self.ledger.clone(),
            Arc::new(AccountCache::new(std::time::Duration::from_secs(60))),
        ))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch_size: self.chunk_size,
            ..EngineConfig::default()
        }
    }

    pub fn engine(&self) -> SettlementEngine {
        self.engine_with(self.engine_config())
    }

    pub fn engine_with(&self, config: EngineConfig) -> SettlementEngine {
        // The sender is dropped: the engine treats a closed channel as "keep running".
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        SettlementEngine::new(
            config,
            self.ledger.clone(),
            self.contract.clone(),
            self.signer.clone(),
            self.accounts(),
            shutdown_rx,
        )
    }
}
