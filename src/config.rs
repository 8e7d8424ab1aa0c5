use std::str::FromStr;

use alloy_primitives::{Address, U256};
use config::{builder::DefaultState, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Minimum gap between the on-chain refund lock time and the auto-settle buffer.
pub const MIN_LOCK_WINDOW_SECS: u64 = 60;
/// Minimum force-settlement interval.
pub const MIN_FORCE_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub ledger_backend: LedgerBackend,
    pub chain: ChainConfig,
    pub tee: TeeConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    /// Endpoint used for `eth_sendTransaction`; falls back to `rpc_url`.
    #[serde(default)]
    pub tx_rpc_url: Option<String>,
    pub contract_address: Address,
    pub provider_address: Address,
    /// Initial gas price in wei (decimal or 0x hex). Node price when unset.
    #[serde(default)]
    pub gas_price: Option<String>,
    #[serde(default)]
    pub max_gas_price: Option<String>,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default = "default_tx_timeout_secs")]
    pub tx_timeout_secs: u64,
    #[serde(default = "default_max_non_gas_retries")]
    pub max_non_gas_retries: u32,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_receipt_rounds")]
    pub receipt_rounds: u32,
    #[serde(default = "default_receipt_interval_secs")]
    pub receipt_interval_secs: u64,
}

/// How the broker reaches the TEE signing capability
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TeeConfig {
    Remote {
        sign_url: String,
        #[serde(default = "default_signer_timeout_secs")]
        timeout_secs: u64,
    },
    /// Development only: the key lives in this process.
    Local { private_key: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default = "zero_amount")]
    pub input_price: String,
    #[serde(default = "zero_amount")]
    pub output_price: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            input_price: zero_amount(),
            output_price: zero_amount(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PurgePolicy {
    /// Move purged records to the dead-letter table before deleting them.
    #[default]
    DeadLetter,
    /// Delete purged records outright.
    Forgive,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SettlementConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_skip_cooldown_secs")]
    pub skip_cooldown_secs: u64,
    #[serde(default = "default_inflight_expiry_secs")]
    pub inflight_expiry_secs: u64,
    #[serde(default = "default_old_request_threshold_secs")]
    pub old_request_threshold_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_force_interval_secs")]
    pub force_interval_secs: u64,
    #[serde(default = "default_auto_settle_buffer_secs")]
    pub auto_settle_buffer_secs: u64,
    #[serde(default)]
    pub purge_policy: PurgePolicy,
    #[serde(default = "default_account_cache_ttl_secs")]
    pub account_cache_ttl_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_rounds: default_max_rounds(),
            skip_cooldown_secs: default_skip_cooldown_secs(),
            inflight_expiry_secs: default_inflight_expiry_secs(),
            old_request_threshold_secs: default_old_request_threshold_secs(),
            check_interval_secs: default_check_interval_secs(),
            force_interval_secs: default_force_interval_secs(),
            auto_settle_buffer_secs: default_auto_settle_buffer_secs(),
            purge_policy: PurgePolicy::default(),
            account_cache_ttl_secs: default_account_cache_ttl_secs(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/broker".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_tx_timeout_secs() -> u64 {
    30
}
fn default_max_non_gas_retries() -> u32 {
    5
}
fn default_retry_interval_secs() -> u64 {
    10
}
fn default_receipt_rounds() -> u32 {
    10
}
fn default_receipt_interval_secs() -> u64 {
    10
}
fn default_signer_timeout_secs() -> u64 {
    10
}
fn zero_amount() -> String {
    "0".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_max_rounds() -> u32 {
    10
}
fn default_skip_cooldown_secs() -> u64 {
    300
}
fn default_inflight_expiry_secs() -> u64 {
    600
}
fn default_old_request_threshold_secs() -> u64 {
    600
}
fn default_check_interval_secs() -> u64 {
    300
}
fn default_force_interval_secs() -> u64 {
    600
}
fn default_auto_settle_buffer_secs() -> u64 {
    60
}
fn default_account_cache_ttl_secs() -> u64 {
    60
}

impl Config {
    /// Load `.env`, then the optional `CONFIG_FILE` (default `config.yaml`),
    /// then `BROKER__SECTION__KEY` environment overrides.
    pub fn from_env() -> AppResult<Self> {
        dotenv::dotenv().ok();

        let path = std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.yaml".to_string());
        let builder = config::Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("BROKER")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?;

        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> AppResult<Self> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Startup checks that do not need the chain.
    pub fn validate(&self) -> AppResult<()> {
        if self.chain.receipt_rounds == 0 {
            return Err(AppError::Config(
                "chain.receipt_rounds must be > 0 (0 polls forever)".into(),
            ));
        }
        if self.chain.tx_timeout_secs == 0 {
            return Err(AppError::Config("chain.tx_timeout_secs must be > 0".into()));
        }

        let gas_price = self.chain.gas_price()?;
        let max_gas_price = self.chain.max_gas_price()?;
        if let (Some(gas), Some(max)) = (gas_price, max_gas_price) {
            if max < gas {
                return Err(AppError::Config(format!(
                    "chain.max_gas_price {} is below chain.gas_price {}",
                    max, gas
                )));
            }
        }

        let s = &self.settlement;
        if s.batch_size == 0 {
            return Err(AppError::Config("settlement.batch_size must be > 0".into()));
        }
        if s.max_rounds == 0 {
            return Err(AppError::Config("settlement.max_rounds must be > 0".into()));
        }
        if s.check_interval_secs == 0 {
            return Err(AppError::Config(
                "settlement.check_interval_secs must be > 0".into(),
            ));
        }
        if s.force_interval_secs < MIN_FORCE_INTERVAL_SECS {
            return Err(AppError::Config(format!(
                "settlement.force_interval_secs must be at least {}",
                MIN_FORCE_INTERVAL_SECS
            )));
        }
        if s.auto_settle_buffer_secs > s.force_interval_secs {
            return Err(AppError::Config(format!(
                "settlement.auto_settle_buffer_secs {} exceeds force_interval_secs {}",
                s.auto_settle_buffer_secs, s.force_interval_secs
            )));
        }

        self.service.prices()?;
        Ok(())
    }

    /// Checks that depend on the contract's refund lock time.
    pub fn validate_lock_time(&self, lock_time_secs: u64) -> AppResult<()> {
        let buffer = self.settlement.auto_settle_buffer_secs;
        if buffer > lock_time_secs {
            return Err(AppError::Config(format!(
                "auto_settle_buffer_secs {} exceeds contract lock time {}",
                buffer, lock_time_secs
            )));
        }
        if lock_time_secs - buffer < MIN_LOCK_WINDOW_SECS {
            return Err(AppError::Config(format!(
                "lock time {} minus auto_settle_buffer_secs {} is below {}s",
                lock_time_secs, buffer, MIN_LOCK_WINDOW_SECS
            )));
        }
        Ok(())
    }
}

impl ChainConfig {
    pub fn gas_price(&self) -> AppResult<Option<U256>> {
        parse_optional_wei("chain.gas_price", self.gas_price.as_deref())
    }

    pub fn max_gas_price(&self) -> AppResult<Option<U256>> {
        parse_optional_wei("chain.max_gas_price", self.max_gas_price.as_deref())
    }

    pub fn tx_rpc_url(&self) -> &str {
        self.tx_rpc_url.as_deref().unwrap_or(&self.rpc_url)
    }
}

impl ServiceConfig {
    pub fn prices(&self) -> AppResult<(U256, U256)> {
        let input = parse_wei("service.input_price", &self.input_price)?;
        let output = parse_wei("service.output_price", &self.output_price)?;
        Ok((input, output))
    }
}

fn parse_wei(field: &str, value: &str) -> AppResult<U256> {
    U256::from_str(value.trim())
        .map_err(|_| AppError::Config(format!("{} is not an integer amount: {}", field, value)))
}

fn parse_optional_wei(field: &str, value: Option<&str>) -> AppResult<Option<U256>> {
    value.map(|v| parse_wei(field, v)).transpose()
}
