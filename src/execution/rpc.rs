use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy_primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ChainError;

/// Transaction submitted through a signer-managed endpoint (`eth_sendTransaction`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Bytes,
    pub gas_price: U256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas: Option<U64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(default)]
    pub block_number: Option<U64>,
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

/// The handful of node calls the settlement engine needs.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// `eth_call` against the latest block.
    async fn call(&self, from: Address, to: Address, data: Bytes) -> Result<Bytes, ChainError>;

    async fn gas_price(&self) -> Result<U256, ChainError>;

    async fn send_transaction(&self, tx: &TxRequest) -> Result<B256, ChainError>;

    async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<TransactionReceipt>, ChainError>;
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

/// JSON-RPC over HTTP
pub struct JsonRpcClient {
    http: reqwest::Client,
    url: String,
    tx_url: String,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: &str, tx_url: &str, request_timeout: Duration) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(ChainError::from)?;

        Ok(Self {
            http,
            url: url.to_string(),
            tx_url: tx_url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    async fn request<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("📡 {} (id {})", method, id);
        let response: RpcResponse = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        let result = response.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| ChainError::InvalidResponse(format!("{}: {}", method, e)))
    }
}

#[async_trait]
impl ChainRpc for JsonRpcClient {
    async fn call(&self, from: Address, to: Address, data: Bytes) -> Result<Bytes, ChainError> {
        self.request(
            &self.url,
            "eth_call",
            json!([{ "from": from, "to": to, "data": data }, "latest"]),
        )
        .await
    }

    async fn gas_price(&self) -> Result<U256, ChainError> {
        self.request(&self.url, "eth_gasPrice", json!([])).await
    }

    async fn send_transaction(&self, tx: &TxRequest) -> Result<B256, ChainError> {
        self.request(&self.tx_url, "eth_sendTransaction", json!([tx]))
            .await
    }

    async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        self.request(&self.url, "eth_getTransactionReceipt", json!([tx_hash]))
            .await
    }
}
