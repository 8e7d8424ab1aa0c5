use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use alloy_sol_types::{sol, SolCall, SolEvent};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::retry::TxRetryPolicy;
use super::rpc::{ChainRpc, TransactionReceipt, TxRequest};
use crate::error::ChainError;

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct TEESettlementData {
        address user;
        address provider;
        uint256 totalFee;
        bytes32 requestsHash;
        uint256 nonce;
        bytes signature;
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Account {
        address user;
        address provider;
        uint256 nonce;
        uint256 balance;
        uint256 pendingRefund;
        uint256[2] signer;
        bool acknowledged;
    }

    function previewSettlementResults(TEESettlementData[] settlements)
        external
        view
        returns (
            address[] failedUsers,
            uint8[] failureReasons,
            address[] partialUsers,
            uint256[] partialAmounts
        );

    function settleFeesWithTEE(TEESettlementData[] settlements) external;

    function getAccount(address user, address provider) external view returns (Account account);

    function getAccountsByProvider(address provider, uint256 offset, uint256 limit)
        external
        view
        returns (Account[] accounts, uint256 total);

    function lockTime() external view returns (uint256);

    event TEESettlementResult(address indexed user, uint8 status, uint256 unsettledAmount);
}

/// Escrow state of one user as seen on chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainAccount {
    pub user: Address,
    pub nonce: U256,
    pub balance: U256,
    pub pending_refund: U256,
    pub signer: [U256; 2],
    pub acknowledged: bool,
}

impl ChainAccount {
    pub fn lock_balance(&self) -> U256 {
        self.balance.saturating_sub(self.pending_refund)
    }
}

impl From<Account> for ChainAccount {
    fn from(account: Account) -> Self {
        Self {
            user: account.user,
            nonce: account.nonce,
            balance: account.balance,
            pending_refund: account.pendingRefund,
            signer: account.signer,
            acknowledged: account.acknowledged,
        }
    }
}

/// Raw preview output: status codes are interpreted by the settlement layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviewReport {
    pub failed: Vec<(Address, u8)>,
    pub partial: Vec<(Address, U256)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEvent {
    pub user: Address,
    pub status: u8,
    pub unsettled_amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettleReceipt {
    pub tx_hash: B256,
    pub events: Vec<SettlementEvent>,
}

/// Escrow contract operations used by the settlement engine
#[async_trait]
pub trait SettlementContract: Send + Sync {
    fn provider_address(&self) -> Address;

    /// Static call: evaluates the batch without changing chain state.
    async fn preview_settlements(
        &self,
        settlements: &[TEESettlementData],
    ) -> Result<PreviewReport, ChainError>;

    /// Submit the batch and wait for its receipt.
    async fn settle_fees(
        &self,
        settlements: &[TEESettlementData],
    ) -> Result<SettleReceipt, ChainError>;

    async fn get_account(&self, user: Address) -> Result<Option<ChainAccount>, ChainError>;

    /// One page of this provider's accounts, plus the total count.
    async fn list_accounts(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ChainAccount>, u64), ChainError>;

    /// Refund lock time in seconds.
    async fn lock_time(&self) -> Result<u64, ChainError>;
}

/// `SettlementContract` over JSON-RPC
pub struct EvmServingContract {
    rpc: Arc<dyn ChainRpc>,
    policy: TxRetryPolicy,
    contract: Address,
    provider: Address,
    gas_price: Option<U256>,
    gas_limit: Option<u64>,
}

impl EvmServingContract {
    pub fn new(
        rpc: Arc<dyn ChainRpc>,
        policy: TxRetryPolicy,
        contract: Address,
        provider: Address,
    ) -> Self {
        Self {
            rpc,
            policy,
            contract,
            provider,
            gas_price: None,
            gas_limit: None,
        }
    }

    pub fn with_gas_price(mut self, gas_price: Option<U256>) -> Self {
        self.gas_price = gas_price;
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: Option<u64>) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    async fn static_call<C: SolCall>(&self, call: C) -> Result<C::Return, ChainError> {
        let data = Bytes::from(call.abi_encode());
        let output = self
            .policy
            .call_with_retry(|| {
                self.rpc
                    .call(self.provider, self.contract, data.clone())
            })
            .await?;

        C::abi_decode_returns(&output, true).map_err(|e| ChainError::Decode(e.to_string()))
    }

    fn decode_events(&self, receipt: &TransactionReceipt) -> Vec<SettlementEvent> {
        receipt
            .logs
            .iter()
            .filter(|log| log.address == self.contract)
            .filter(|log| log.topics.first() == Some(&TEESettlementResult::SIGNATURE_HASH))
            .filter_map(|log| {
                match TEESettlementResult::decode_raw_log(log.topics.iter().copied(), &log.data, true) {
                    Ok(event) => Some(SettlementEvent {
                        user: event.user,
                        status: event.status,
                        unsettled_amount: event.unsettledAmount,
                    }),
                    Err(e) => {
                        warn!("undecodable TEESettlementResult log: {}", e);
                        None
                    }
                }
            })
            .collect()
    }
}

fn is_revert(err: &ChainError) -> bool {
    match err {
        ChainError::Rpc { code, message } => *code == 3 || message.contains("execution reverted"),
        _ => false,
    }
}

/// Send failures after which the node may already hold the transaction.
fn is_ambiguous_send(err: &ChainError) -> bool {
    matches!(
        err,
        ChainError::Timeout(_)
            | ChainError::Transport(_)
            | ChainError::MempoolWithoutMaxGasPrice(_)
            | ChainError::MaxGasPriceExceeded { .. }
    )
}

#[async_trait]
impl SettlementContract for EvmServingContract {
    fn provider_address(&self) -> Address {
        self.provider
    }

    #[instrument(skip(self, settlements), fields(count = settlements.len()))]
    async fn preview_settlements(
        &self,
        settlements: &[TEESettlementData],
    ) -> Result<PreviewReport, ChainError> {
        let result = self
            .static_call(previewSettlementResultsCall {
                settlements: settlements.to_vec(),
            })
            .await?;

        if result.failedUsers.len() != result.failureReasons.len()
            || result.partialUsers.len() != result.partialAmounts.len()
        {
            return Err(ChainError::Decode(
                "preview result arrays have mismatched lengths".into(),
            ));
        }

        Ok(PreviewReport {
            failed: result
                .failedUsers
                .into_iter()
                .zip(result.failureReasons)
                .collect(),
            partial: result
                .partialUsers
                .into_iter()
                .zip(result.partialAmounts)
                .collect(),
        })
    }

    #[instrument(skip(self, settlements), fields(count = settlements.len()))]
    async fn settle_fees(
        &self,
        settlements: &[TEESettlementData],
    ) -> Result<SettleReceipt, ChainError> {
        let data = Bytes::from(
            settleFeesWithTEECall {
                settlements: settlements.to_vec(),
            }
            .abi_encode(),
        );

        let initial_gas_price = match self.gas_price {
            Some(price) => price,
            None => self.policy.call_with_retry(|| self.rpc.gas_price()).await?,
        };

        // Sends that left this process; any of them may still be mined
        let mut sends = 0u32;
        let sent = self
            .policy
            .transact_with_gas_adjustment(initial_gas_price, |gas_price| {
                sends += 1;
                let request = TxRequest {
                    from: self.provider,
                    to: self.contract,
                    data: data.clone(),
                    gas_price,
                    gas: self.gas_limit.map(U64::from),
                };
                let rpc = self.rpc.clone();
                async move { rpc.send_transaction(&request).await }
            })
            .await;
        let tx_hash = match sent {
            Ok(tx_hash) => tx_hash,
            Err(err) if sends > 1 || is_ambiguous_send(&err) => {
                return Err(ChainError::unconfirmed(None, err));
            }
            Err(err) => return Err(err),
        };

        info!("📤 Settlement transaction sent: {}", tx_hash);
        let receipt = match self.policy.wait_for_receipt(self.rpc.as_ref(), tx_hash).await {
            Ok(receipt) => receipt,
            // Mined and reverted: nothing applied
            Err(err @ ChainError::Reverted(_)) => return Err(err),
            Err(err) => return Err(ChainError::unconfirmed(Some(tx_hash), err)),
        };
        let events = self.decode_events(&receipt);
        debug!("🧾 {} settlement events in {}", events.len(), tx_hash);

        Ok(SettleReceipt { tx_hash, events })
    }

    async fn get_account(&self, user: Address) -> Result<Option<ChainAccount>, ChainError> {
        match self
            .static_call(getAccountCall {
                user,
                provider: self.provider,
            })
            .await
        {
            Ok(result) => Ok(Some(result.account.into())),
            // The contract reverts for unknown accounts
            Err(err) if is_revert(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn list_accounts(
        &self,
        offset: u64,
        limit: u64,
    ) -> Result<(Vec<ChainAccount>, u64), ChainError> {
        let result = self
            .static_call(getAccountsByProviderCall {
                provider: self.provider,
                offset: U256::from(offset),
                limit: U256::from(limit),
            })
            .await?;

        let total = u64::try_from(result.total)
            .map_err(|_| ChainError::Decode("account total overflows u64".into()))?;
        Ok((result.accounts.into_iter().map(Into::into).collect(), total))
    }

    async fn lock_time(&self) -> Result<u64, ChainError> {
        let result = self.static_call(lockTimeCall {}).await?;
        u64::try_from(result._0).map_err(|_| ChainError::Decode("lock time overflows u64".into()))
    }
}
