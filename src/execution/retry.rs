//! Timeout, gas-price escalation and bounded retry around single chain calls.

use std::future::Future;
use std::time::Duration;

use alloy_primitives::{B256, U256, U64};
use tracing::{debug, warn};

use super::rpc::{ChainRpc, TransactionReceipt};
use crate::config::ChainConfig;
use crate::error::{AppResult, ChainError};

const NODE_SYNC_ERROR: &str = "specified block header does not exist";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Mempool congestion or an attempt timeout: bump the gas price.
    GasEscalation,
    /// Node has not caught up yet: retry as is.
    NodeSync,
    Fatal,
}

pub fn classify_error(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    if message.contains("mempool") || message.contains("timeout") {
        ErrorClass::GasEscalation
    } else if message.contains(NODE_SYNC_ERROR) {
        ErrorClass::NodeSync
    } else {
        ErrorClass::Fatal
    }
}

#[derive(Debug, Clone)]
pub struct TxRetryPolicy {
    pub attempt_timeout: Duration,
    pub max_gas_price: Option<U256>,
    pub max_non_gas_retries: u32,
    pub retry_interval: Duration,
    pub receipt_rounds: u32,
    pub receipt_interval: Duration,
}

impl TxRetryPolicy {
    pub fn from_config(chain: &ChainConfig) -> AppResult<Self> {
        Ok(Self {
            attempt_timeout: Duration::from_secs(chain.tx_timeout_secs),
            max_gas_price: chain.max_gas_price()?,
            max_non_gas_retries: chain.max_non_gas_retries,
            retry_interval: Duration::from_secs(chain.retry_interval_secs),
            receipt_rounds: chain.receipt_rounds,
            receipt_interval: Duration::from_secs(chain.receipt_interval_secs),
        })
    }

    /// 10% bump, capped at `max`, always moving at least one wei.
    fn escalate(current: U256, max: U256) -> U256 {
        let bumped = current * U256::from(11u8) / U256::from(10u8);
        bumped.max(current + U256::from(1u8)).min(max)
    }

    /// Run a write attempt until it succeeds, a fatal error occurs, the gas
    /// ceiling is reached, or non-gas retries are exhausted.
    pub async fn transact_with_gas_adjustment<F, Fut, T>(
        &self,
        initial_gas_price: U256,
        mut attempt: F,
    ) -> Result<T, ChainError>
    where
        F: FnMut(U256) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut gas_price = initial_gas_price;
        let mut non_gas_retries = 0u32;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let err = match tokio::time::timeout(self.attempt_timeout, attempt(gas_price)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => ChainError::Timeout(self.attempt_timeout.as_secs()),
            };

            match classify_error(&err.to_string()) {
                ErrorClass::GasEscalation => {
                    let Some(max) = self.max_gas_price else {
                        return Err(ChainError::MempoolWithoutMaxGasPrice(err.to_string()));
                    };
                    if gas_price >= max {
                        return Err(ChainError::MaxGasPriceExceeded {
                            current: gas_price,
                            max,
                        });
                    }
                    let next = Self::escalate(gas_price, max);
                    warn!(
                        attempt = attempts,
                        "⛽ {} - raising gas price {} -> {}", err, gas_price, next
                    );
                    gas_price = next;
                }
                ErrorClass::NodeSync => {
                    if non_gas_retries >= self.max_non_gas_retries {
                        return Err(ChainError::RetriesExhausted {
                            attempts,
                            last: err.to_string(),
                        });
                    }
                    non_gas_retries += 1;
                    warn!(
                        attempt = attempts,
                        "🔁 {} - retry {}/{}", err, non_gas_retries, self.max_non_gas_retries
                    );
                }
                ErrorClass::Fatal => return Err(err),
            }

            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Read calls: timeouts and node-sync errors share the non-gas budget.
    pub async fn call_with_retry<F, Fut, T>(&self, mut call: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut retries = 0u32;

        loop {
            let err = match tokio::time::timeout(self.attempt_timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => err,
                Err(_) => ChainError::Timeout(self.attempt_timeout.as_secs()),
            };

            if classify_error(&err.to_string()) == ErrorClass::Fatal {
                return Err(err);
            }
            if retries >= self.max_non_gas_retries {
                return Err(ChainError::RetriesExhausted {
                    attempts: retries + 1,
                    last: err.to_string(),
                });
            }
            retries += 1;
            debug!("🔁 read retry {}/{}: {}", retries, self.max_non_gas_retries, err);
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Poll for a receipt. Zero rounds polls forever.
    pub async fn wait_for_receipt(
        &self,
        rpc: &dyn ChainRpc,
        tx_hash: B256,
    ) -> Result<TransactionReceipt, ChainError> {
        let mut round = 0u32;

        loop {
            match rpc.transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => return check_receipt_status(receipt),
                Ok(None) => debug!("⏳ receipt for {} not available yet", tx_hash),
                Err(err) => warn!("receipt lookup for {} failed: {}", tx_hash, err),
            }

            round += 1;
            if self.receipt_rounds != 0 && round >= self.receipt_rounds {
                return Err(ChainError::ReceiptNotFound {
                    tx_hash,
                    rounds: self.receipt_rounds,
                });
            }
            tokio::time::sleep(self.receipt_interval).await;
        }
    }
}

pub fn check_receipt_status(receipt: TransactionReceipt) -> Result<TransactionReceipt, ChainError> {
    let tx_hash = receipt.transaction_hash;
    match receipt.status {
        Some(status) if status == U64::from(1) => Ok(receipt),
        Some(status) if status == U64::ZERO => Err(ChainError::Reverted(tx_hash)),
        Some(status) => Err(ChainError::UnknownReceiptStatus {
            tx_hash,
            status: status.to::<u64>(),
        }),
        None => Err(ChainError::InvalidResponse(format!(
            "receipt for {} has no status",
            tx_hash
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use alloy_primitives::{Address, Bytes};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::execution::rpc::TxRequest;

    fn policy(max_gas_price: Option<U256>) -> TxRetryPolicy {
        TxRetryPolicy {
            attempt_timeout: Duration::from_secs(5),
            max_gas_price,
            max_non_gas_retries: 2,
            retry_interval: Duration::ZERO,
            receipt_rounds: 3,
            receipt_interval: Duration::ZERO,
        }
    }

    fn congestion() -> ChainError {
        ChainError::Rpc {
            code: -32000,
            message: "mempool is full".into(),
        }
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error("txpool: Mempool is full"), ErrorClass::GasEscalation);
        assert_eq!(classify_error("Attempt timeout after 30s"), ErrorClass::GasEscalation);
        assert_eq!(
            classify_error("rpc error: specified block header does not exist"),
            ErrorClass::NodeSync
        );
        assert_eq!(classify_error("execution reverted"), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_gas_escalation_stops_at_max_gas_price() {
        let initial = U256::from(100u64);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let result: Result<(), _> = policy(Some(U256::from(120u64)))
            .transact_with_gas_adjustment(initial, |gas| {
                seen.lock().push(gas);
                async { Err(congestion()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ChainError::MaxGasPriceExceeded { current, max })
                if current == U256::from(120u64) && max == U256::from(120u64)
        ));
        assert_eq!(
            *seen.lock(),
            vec![U256::from(100u64), U256::from(110u64), U256::from(120u64)]
        );
    }

    #[tokio::test]
    async fn test_congestion_without_max_gas_price_fails_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy(None)
            .transact_with_gas_adjustment(U256::from(100u64), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(congestion()) }
            })
            .await;

        assert!(matches!(result, Err(ChainError::MempoolWithoutMaxGasPrice(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_node_sync_retries_are_bounded() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy(Some(U256::from(1_000u64)))
            .transact_with_gas_adjustment(U256::from(100u64), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ChainError::Rpc {
                        code: -32000,
                        message: NODE_SYNC_ERROR.into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ChainError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy(Some(U256::from(1_000u64)))
            .transact_with_gas_adjustment(U256::from(100u64), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ChainError::Rpc {
                        code: 3,
                        message: "execution reverted".into(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(ChainError::Rpc { code: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out_and_escalates() {
        let mut policy = policy(Some(U256::from(200u64)));
        policy.attempt_timeout = Duration::from_millis(20);
        let calls = AtomicU32::new(0);

        let result = policy
            .transact_with_gas_adjustment(U256::from(100u64), |gas| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                    Ok(gas)
                }
            })
            .await
            .unwrap();

        assert_eq!(result, U256::from(110u64));
    }

    struct ScriptedReceipts {
        responses: Mutex<Vec<Option<TransactionReceipt>>>,
    }

    #[async_trait]
    impl ChainRpc for ScriptedReceipts {
        async fn call(&self, _: Address, _: Address, _: Bytes) -> Result<Bytes, ChainError> {
            unimplemented!()
        }
        async fn gas_price(&self) -> Result<U256, ChainError> {
            unimplemented!()
        }
        async fn send_transaction(&self, _: &TxRequest) -> Result<B256, ChainError> {
            unimplemented!()
        }
        async fn transaction_receipt(
            &self,
            _: B256,
        ) -> Result<Option<TransactionReceipt>, ChainError> {
            let mut responses = self.responses.lock();
            Ok(if responses.is_empty() { None } else { responses.remove(0) })
        }
    }

    fn receipt(status: u64) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: B256::repeat_byte(0xab),
            block_number: Some(U64::from(1)),
            status: Some(U64::from(status)),
            logs: vec![],
        }
    }

    #[tokio::test]
    async fn test_wait_for_receipt_statuses() {
        let rpc = ScriptedReceipts {
            responses: Mutex::new(vec![None, Some(receipt(1))]),
        };
        let ok = policy(None).wait_for_receipt(&rpc, B256::ZERO).await;
        assert!(ok.is_ok());

        let rpc = ScriptedReceipts {
            responses: Mutex::new(vec![Some(receipt(0))]),
        };
        let reverted = policy(None).wait_for_receipt(&rpc, B256::ZERO).await;
        assert!(matches!(reverted, Err(ChainError::Reverted(_))));

        let rpc = ScriptedReceipts {
            responses: Mutex::new(vec![Some(receipt(7))]),
        };
        let unknown = policy(None).wait_for_receipt(&rpc, B256::ZERO).await;
        assert!(matches!(unknown, Err(ChainError::UnknownReceiptStatus { status: 7, .. })));
    }

    #[tokio::test]
    async fn test_wait_for_receipt_gives_up_after_rounds() {
        let rpc = ScriptedReceipts {
            responses: Mutex::new(vec![]),
        };
        let result = policy(None).wait_for_receipt(&rpc, B256::ZERO).await;
        assert!(matches!(result, Err(ChainError::ReceiptNotFound { rounds: 3, .. })));
    }
}
