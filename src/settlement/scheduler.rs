// Settlement Scheduler - two independent tickers
//
// - Check ticker: sweeps the account cache, then settles only accounts close
//   to their lock-balance threshold
// - Force ticker: full drain of every eligible record
//
// Both go through the engine's round lock, so they never overlap with each
// other or with an HTTP-triggered settlement.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{error, info};

use super::SettlementEngine;
use crate::config::SettlementConfig;

/// Settlement schedule configuration
#[derive(Debug, Clone, Copy)]
pub struct SettlementScheduleConfig {
    pub check_interval: Duration,
    pub force_interval: Duration,
}

impl From<&SettlementConfig> for SettlementScheduleConfig {
    fn from(config: &SettlementConfig) -> Self {
        Self {
            check_interval: Duration::from_secs(config.check_interval_secs),
            force_interval: Duration::from_secs(config.force_interval_secs),
        }
    }
}

pub struct SettlementScheduler {
    config: SettlementScheduleConfig,
    engine: Arc<SettlementEngine>,
    shutdown: watch::Receiver<bool>,
}

impl SettlementScheduler {
    pub fn new(
        config: SettlementScheduleConfig,
        engine: Arc<SettlementEngine>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            engine,
            shutdown,
        }
    }

    /// Start the settlement scheduler (runs in background)
    pub fn start(&self) -> JoinHandle<()> {
        let config = self.config;
        let engine = self.engine.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!(
                "⏰ Settlement scheduler started: check every {:?}, force every {:?}",
                config.check_interval, config.force_interval
            );

            let mut check = interval_at(Instant::now() + config.check_interval, config.check_interval);
            let mut force = interval_at(Instant::now() + config.force_interval, config.force_interval);
            check.set_missed_tick_behavior(MissedTickBehavior::Delay);
            force.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = check.tick() => {
                        engine.accounts().cache().cleanup_expired().await;
                        match engine.process_settlement().await {
                            Ok(summary) => info!("✓ Periodic check finished: {:?}", summary.exit),
                            Err(e) => error!("❌ Periodic settlement check failed: {}", e),
                        }
                    }
                    _ = force.tick() => {
                        info!("🔄 Starting forced settlement cycle");
                        match engine.force_settle().await {
                            Ok(summary) => info!(
                                "✓ Forced settlement finished: {} records settled in {} rounds",
                                summary.settled_records, summary.rounds
                            ),
                            Err(e) => error!("❌ Forced settlement failed: {}", e),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("🛑 Settlement scheduler stopped");
        })
    }
}
