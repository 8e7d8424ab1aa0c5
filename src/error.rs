use alloy_primitives::{B256, U256};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Settlement error: {0}")]
    Settlement(#[from] SettlementError),

    #[error("Signer error: {0}")]
    Signer(#[from] SignerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("External error: {0}")]
    ExternalError(String),

    #[error("Service is shutting down")]
    ShuttingDown,
}

/// Ledger store errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Usage record already exists: {0}")]
    DuplicateRecord(String),

    #[error("Invalid amount in {field}: {value}")]
    InvalidAmount { field: String, value: String },
}

/// Chain access errors, consumed by the transaction retry layer
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("Attempt timeout after {0}s")]
    Timeout(u64),

    #[error("Mempool congestion and no max gas price configured: {0}")]
    MempoolWithoutMaxGasPrice(String),

    #[error("Cannot exceed max gas price: current {current}, max {max}")]
    MaxGasPriceExceeded { current: U256, max: U256 },

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("Transaction execution failed: {0}")]
    Reverted(B256),

    #[error("Unknown receipt status {status} for transaction {tx_hash}")]
    UnknownReceiptStatus { tx_hash: B256, status: u64 },

    #[error("No receipt for transaction {tx_hash} after {rounds} rounds")]
    ReceiptNotFound { tx_hash: B256, rounds: u32 },

    /// The transaction may be on its way to the chain; its outcome is unknown.
    #[error("Settlement transaction possibly broadcast ({tx_hash:?}): {cause}")]
    Unconfirmed {
        tx_hash: Option<B256>,
        cause: Box<ChainError>,
    },

    #[error("ABI decode error: {0}")]
    Decode(String),

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),
}

/// Settlement pipeline errors
#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Invalid user address {0}")]
    InvalidUser(String),

    #[error("Batch for {user} has no records")]
    EmptyBatch { user: String },
}

/// TEE signing errors
#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Remote signer request failed: {0}")]
    Remote(String),

    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Malformed signature: {0}")]
    MalformedSignature(String),
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match self {
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("Not found: {}", what),
                None,
            ),
            AppError::InvalidInput(reason) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                reason,
                None,
            ),
            AppError::InvalidAddress(address) => (
                StatusCode::BAD_REQUEST,
                "INVALID_ADDRESS",
                format!("Invalid address: {}", address),
                Some(serde_json::json!({ "address": address })),
            ),
            AppError::Ledger(LedgerError::DuplicateRecord(hash)) => (
                StatusCode::CONFLICT,
                "DUPLICATE_RECORD",
                format!("Usage record already exists: {}", hash),
                Some(serde_json::json!({ "request_hash": hash })),
            ),
            AppError::Ledger(LedgerError::InvalidAmount { field, value }) => (
                StatusCode::BAD_REQUEST,
                "INVALID_AMOUNT",
                format!("Invalid amount in {}", field),
                Some(serde_json::json!({ "field": field, "value": value })),
            ),
            AppError::Chain(err) => (
                StatusCode::BAD_GATEWAY,
                "CHAIN_ERROR",
                err.to_string(),
                None,
            ),
            AppError::Signer(err) => (
                StatusCode::BAD_GATEWAY,
                "SIGNER_ERROR",
                err.to_string(),
                None,
            ),
            AppError::ShuttingDown => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SHUTTING_DOWN",
                "Service is shutting down".to_string(),
                None,
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
                None,
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(error: reqwest::Error) -> Self {
        AppError::ExternalError(format!("HTTP request error: {:?}", error))
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl ChainError {
    /// A failed write that may still land on chain.
    pub fn may_have_broadcast(&self) -> bool {
        matches!(self, ChainError::Unconfirmed { .. })
    }

    pub fn unconfirmed(tx_hash: Option<B256>, cause: ChainError) -> Self {
        ChainError::Unconfirmed {
            tx_hash,
            cause: Box::new(cause),
        }
    }
}

impl From<reqwest::Error> for ChainError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ChainError::Transport(format!("request timeout: {}", error))
        } else {
            ChainError::Transport(error.to_string())
        }
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_classification_text() {
        let err = ChainError::Timeout(30);
        assert!(err.to_string().contains("timeout"));

        let err = ChainError::MaxGasPriceExceeded {
            current: U256::from(12u64),
            max: U256::from(12u64),
        };
        assert!(err.to_string().contains("Cannot exceed max gas price"));
    }

    #[test]
    fn test_chain_error_maps_to_bad_gateway() {
        let response = AppError::Chain(ChainError::Transport("down".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = AppError::NotFound("account".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
