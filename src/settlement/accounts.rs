use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::execution::contract::{ChainAccount, SettlementContract};
use crate::ledger::models::{normalize_address, LedgerAccount, SyncStats, SyncedAccount};
use crate::ledger::LedgerStore;

/// Accounts fetched per `getAccountsByProvider` call.
pub const ACCOUNT_PAGE_SIZE: u64 = 50;

#[derive(Debug, Clone)]
struct CachedAccount {
    account: LedgerAccount,
    cached_at: DateTime<Utc>,
}

/// In-memory account cache with TTL, keyed by checksummed user address
pub struct AccountCache {
    cache: Arc<RwLock<HashMap<String, CachedAccount>>>,
    ttl: Duration,
}

impl AccountCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn is_fresh(&self, entry: &CachedAccount, now: DateTime<Utc>) -> bool {
        (now - entry.cached_at)
            .to_std()
            .map_or(true, |age| age < self.ttl)
    }

    /// Get cached account if it exists and is still fresh
    pub async fn get(&self, user: &str) -> Option<LedgerAccount> {
        let cache = self.cache.read().await;
        let entry = cache.get(user)?;
        if self.is_fresh(entry, Utc::now()) {
            debug!("✓ Account cache hit: {}", user);
            Some(entry.account.clone())
        } else {
            debug!("⚠ Account cache stale: {}", user);
            None
        }
    }

    pub async fn set(&self, account: LedgerAccount) {
        let mut cache = self.cache.write().await;
        cache.insert(
            account.user_address.clone(),
            CachedAccount {
                account,
                cached_at: Utc::now(),
            },
        );
    }

    pub async fn invalidate(&self, user: &str) {
        self.cache.write().await.remove(user);
    }

    /// Drop everything; called after every account sync.
    pub async fn invalidate_all(&self) {
        let mut cache = self.cache.write().await;
        cache.clear();
        info!("🔄 Account cache cleared");
    }

    /// Evict stale entries, returning how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut cache = self.cache.write().await;

        let before = cache.len();
        cache.retain(|_, entry| self.is_fresh(entry, now));
        let after = cache.len();

        if before > after {
            info!("🧹 Cleaned up {} expired account entries", before - after);
        }
        before - after
    }
}

/// Mirrors this provider's on-chain escrow accounts into the ledger.
pub struct AccountSync {
    contract: Arc<dyn SettlementContract>,
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<AccountCache>,
}

impl AccountSync {
    pub fn new(
        contract: Arc<dyn SettlementContract>,
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<AccountCache>,
    ) -> Self {
        Self {
            contract,
            ledger,
            cache,
        }
    }

    pub fn cache(&self) -> &AccountCache {
        &self.cache
    }

    /// Page through every account of this provider and reconcile the local set.
    pub async fn sync_all(&self) -> AppResult<SyncStats> {
        let mut synced = Vec::new();
        let mut offset = 0u64;
        loop {
            let (page, total) = self
                .contract
                .list_accounts(offset, ACCOUNT_PAGE_SIZE)
                .await?;
            let fetched = page.len() as u64;
            synced.extend(page.iter().map(to_synced));
            offset += fetched;
            if fetched == 0 || offset >= total {
                break;
            }
        }

        let stats = self.ledger.sync_accounts(&synced, Utc::now()).await?;
        self.cache.invalidate_all().await;
        info!(
            "🔁 Synced {} accounts: {} added, {} updated, {} removed",
            synced.len(),
            stats.added,
            stats.updated,
            stats.removed
        );
        Ok(stats)
    }

    /// Cached account view, created from chain state on first sight.
    pub async fn get_or_create_account(&self, user: &str) -> AppResult<LedgerAccount> {
        let user = normalize_address(user).ok_or_else(|| AppError::InvalidAddress(user.to_string()))?;

        if let Some(account) = self.cache.get(&user).await {
            return Ok(account);
        }

        let local = self.ledger.get_account(&user).await?;
        if let Some(account) = local.as_ref().filter(|a| a.last_balance_check_time.is_some()) {
            self.cache.set(account.clone()).await;
            return Ok(account.clone());
        }

        let address = Address::from_str(&user).map_err(|e| AppError::InvalidAddress(e.to_string()))?;
        match self.contract.get_account(address).await? {
            Some(chain) => {
                let account = self.ledger.upsert_account(&to_synced(&chain), Utc::now()).await?;
                debug!("Created local account for {} from chain", user);
                self.cache.set(account.clone()).await;
                Ok(account)
            }
            // Known locally from ingested usage, never funded on chain
            None => local.ok_or_else(|| AppError::NotFound(format!("account {}", user))),
        }
    }
}

fn to_synced(account: &ChainAccount) -> SyncedAccount {
    SyncedAccount {
        user_address: account.user.to_checksum(None),
        lock_balance: account.lock_balance(),
        signer: account.signer.iter().map(|s| s.to_string()).collect(),
    }
}
