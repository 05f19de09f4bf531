//! Periodic recovery loop
//!
//! Runs a recovery pass through the StoreManager on a fixed interval so that
//! leases abandoned by crashed workers become claimable again.

use std::time::Duration;

use leasestore::RecoveryStats;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::daemon::stop_requested;
use crate::service::{ServiceResponse, StoreManager};

/// Drives `scan` on a timer until shutdown
pub struct RecoveryLoop {
    manager: StoreManager,
    interval: Duration,
}

impl RecoveryLoop {
    pub fn new(manager: StoreManager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Run one pass, logging the outcome
    pub async fn tick_once(&self) -> ServiceResponse<RecoveryStats> {
        let stats = self.manager.scan().await?;
        if stats.reclaimed > 0 || stats.lost_races > 0 || stats.skipped > 0 {
            info!(%stats, "Recovery pass reclaimed expired leases");
        } else {
            debug!(%stats, "tick_once: nothing to reclaim");
        }
        Ok(stats)
    }

    /// Loop until the shutdown flag is raised. Failed passes are logged and
    /// retried on the next tick.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Recovery loop starting");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick_once().await {
                        warn!(error = %e, "Recovery pass failed");
                    }
                }
                _ = stop_requested(&mut shutdown_rx) => {
                    debug!("run: shutdown signal received");
                    break;
                }
            }
        }

        info!("Recovery loop stopped");
    }
}
