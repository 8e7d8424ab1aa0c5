use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    api::handler::AppState,
    config::{Config, LedgerBackend, TeeConfig},
    error::AppResult,
    execution::{
        EvmServingContract, JsonRpcClient, LocalTeeSigner, RemoteTeeSigner, SettlementContract,
        TeeSigner, TxRetryPolicy,
    },
    ledger::{InMemoryLedger, LedgerRepository, LedgerStore},
    settlement::{
        accounts::{AccountCache, AccountSync},
        scheduler::{SettlementScheduleConfig, SettlementScheduler},
        EngineConfig, SettlementEngine,
    },
};

/// Everything `main` needs to serve and to shut down.
pub struct Application {
    pub state: AppState,
    pub scheduler: JoinHandle<()>,
    pub shutdown: watch::Sender<bool>,
}

pub async fn initialize_app(config: &Config) -> AppResult<Application> {
    info!("Initializing application components ...");

    // Ledger
    let ledger: Arc<dyn LedgerStore> = match config.ledger_backend {
        LedgerBackend::Postgres => {
            let pool = initialize_database(&config.database_url).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        LedgerBackend::Memory => {
            warn!("⚠️  In-memory ledger selected: records are lost on restart");
            Arc::new(InMemoryLedger::new())
        }
    };
    info!("✅ Ledger store initialized ({:?})", config.ledger_backend);

    // Chain access
    let chain = &config.chain;
    let rpc = Arc::new(JsonRpcClient::new(
        &chain.rpc_url,
        chain.tx_rpc_url(),
        Duration::from_secs(chain.tx_timeout_secs),
    )?);
    let policy = TxRetryPolicy::from_config(chain)?;
    let contract: Arc<dyn SettlementContract> = Arc::new(
        EvmServingContract::new(rpc, policy, chain.contract_address, chain.provider_address)
            .with_gas_price(chain.gas_price()?)
            .with_gas_limit(chain.gas_limit),
    );
    info!(
        "✅ Serving contract {} initialized for provider {}",
        chain.contract_address, chain.provider_address
    );

    let lock_time = contract.lock_time().await?;
    config.validate_lock_time(lock_time)?;
    info!("✓ Contract lock time: {}s", lock_time);

    // TEE signer
    let signer: Arc<dyn TeeSigner> = match &config.tee {
        TeeConfig::Remote {
            sign_url,
            timeout_secs,
        } => {
            info!("✅ Remote TEE signer at {}", sign_url);
            Arc::new(RemoteTeeSigner::new(sign_url, Duration::from_secs(*timeout_secs))?)
        }
        TeeConfig::Local { private_key } => {
            let signer = LocalTeeSigner::from_hex(private_key)?;
            warn!("⚠️  Local TEE signer {} in use (development only)", signer.address());
            Arc::new(signer)
        }
    };

    // Settlement engine
    let (shutdown, shutdown_rx) = watch::channel(false);
    let cache = Arc::new(AccountCache::new(Duration::from_secs(
        config.settlement.account_cache_ttl_secs,
    )));
    let accounts = Arc::new(AccountSync::new(contract.clone(), ledger.clone(), cache));
    let engine = Arc::new(SettlementEngine::new(
        EngineConfig::from_config(config)?,
        ledger.clone(),
        contract,
        signer,
        accounts.clone(),
        shutdown_rx.clone(),
    ));
    info!("✅ Settlement engine initialized");

    let scheduler = SettlementScheduler::new(
        SettlementScheduleConfig::from(&config.settlement),
        engine.clone(),
        shutdown_rx,
    )
    .start();
    info!("✅ Settlement scheduler task started");

    Ok(Application {
        state: AppState {
            ledger,
            engine,
            accounts,
        },
        scheduler,
        shutdown,
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 20 max connections");

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
