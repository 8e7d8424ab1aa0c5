/// TEE signing capability used to authorize settlements.
/// Key material never crosses this boundary: callers hand over a message hash
/// and get back a 65-byte `r || s || v` signature.

use std::time::Duration;

use alloy_primitives::{eip191_hash_message, Address, Bytes, B256};
use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SignerError;

pub const SIGNATURE_LENGTH: usize = 65;

/// Trait for the TEE signing service
#[async_trait]
pub trait TeeSigner: Send + Sync {
    /// Sign a settlement message hash
    ///
    /// The signer applies the EIP-191 personal-message prefix before signing.
    async fn sign(&self, message_hash: B256) -> Result<Bytes, SignerError>;
}

#[derive(Serialize)]
struct SignRequest {
    message_hash: B256,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: Bytes,
}

/// Signer running inside the TEE, reached over HTTP
pub struct RemoteTeeSigner {
    client: reqwest::Client,
    sign_url: String,
}

impl RemoteTeeSigner {
    pub fn new(sign_url: &str, timeout: Duration) -> Result<Self, SignerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignerError::Remote(e.to_string()))?;

        Ok(Self {
            client,
            sign_url: sign_url.to_string(),
        })
    }
}

#[async_trait]
impl TeeSigner for RemoteTeeSigner {
    async fn sign(&self, message_hash: B256) -> Result<Bytes, SignerError> {
        let response = self
            .client
            .post(&self.sign_url)
            .json(&SignRequest { message_hash })
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SignerError::Remote(e.to_string()))?;

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| SignerError::Remote(format!("invalid sign response: {}", e)))?;

        validate_signature(&body.signature)?;
        Ok(body.signature)
    }
}

/// In-process signer for development and tests.
pub struct LocalTeeSigner {
    key: SigningKey,
    address: Address,
}

impl LocalTeeSigner {
    pub fn from_hex(private_key: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(private_key.trim().trim_start_matches("0x"))
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let key =
            SigningKey::from_slice(&bytes).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let address = Address::from_public_key(key.verifying_key());

        Ok(Self { key, address })
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

#[async_trait]
impl TeeSigner for LocalTeeSigner {
    async fn sign(&self, message_hash: B256) -> Result<Bytes, SignerError> {
        let digest = eip191_hash_message(message_hash);
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(digest.as_slice())
            .map_err(|e| SignerError::Signing(e.to_string()))?;

        let mut out = Vec::with_capacity(SIGNATURE_LENGTH);
        out.extend_from_slice(&signature.to_bytes());
        out.push(recovery_id.to_byte() + 27);
        debug!("✍️  Signed settlement message {}", message_hash);
        Ok(Bytes::from(out))
    }
}

fn validate_signature(signature: &Bytes) -> Result<(), SignerError> {
    if signature.len() != SIGNATURE_LENGTH {
        return Err(SignerError::MalformedSignature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LENGTH,
            signature.len()
        )));
    }
    let v = signature[SIGNATURE_LENGTH - 1];
    if v != 27 && v != 28 {
        return Err(SignerError::MalformedSignature(format!("invalid v {}", v)));
    }
    Ok(())
}
