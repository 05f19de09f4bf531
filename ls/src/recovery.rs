//! Crash recovery
//!
//! Finds entities whose lease lapsed without a release (the holder crashed
//! or gave up) and clears the lease so the work can be picked up again.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::{Store, update_existing};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};

/// Recovery statistics for one pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    /// Entities found with an expired lease
    pub scanned: usize,
    /// Leases cleared by this pass
    pub reclaimed: usize,
    /// Entities whose lease changed hands before we could clear it
    pub lost_races: usize,
    /// Entities left for the next pass because they stayed contended
    #[serde(default)]
    pub skipped: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scanned: {}, reclaimed: {}, lost races: {}, skipped: {}",
            self.scanned, self.reclaimed, self.lost_races, self.skipped
        )
    }
}

/// Reclaims expired leases
#[derive(Clone)]
pub struct RecoveryScanner {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl RecoveryScanner {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Run one pass over all expired leases.
    ///
    /// Each clear is conditional on the lease token seen by the scan. If the
    /// token moved on (released, re-acquired) the entity is left alone. A key
    /// that stays contended is skipped and picked up by a later pass.
    pub fn scan_once(&self) -> StoreResult<RecoveryStats> {
        let now = self.clock.now_ms();
        let expired = self.store.scan_expired(now)?;
        let mut stats = RecoveryStats {
            scanned: expired.len(),
            ..Default::default()
        };

        for record in expired {
            let Some(observed) = record.lease else {
                continue;
            };

            let result = update_existing(self.store.as_ref(), &record.key, |current| {
                match &current.lease {
                    Some(lease) if lease.token == observed.token && lease.is_expired(now) => {}
                    _ => return Err(StoreError::InvalidToken(record.key.clone())),
                }
                let mut next = current.clone();
                next.lease = None;
                Ok((next, ()))
            });

            match result {
                Ok(()) => {
                    info!(
                        key = %record.key,
                        owner = %observed.owner,
                        expired_at = observed.expires_at,
                        "Reclaimed expired lease"
                    );
                    stats.reclaimed += 1;
                }
                Err(StoreError::InvalidToken(_) | StoreError::NotFound(_)) => {
                    debug!(key = %record.key, "Lease changed since scan, skipping");
                    stats.lost_races += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(key = %record.key, error = %e, "Could not reclaim lease, leaving it for the next pass");
                    stats.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        if stats.scanned > 0 {
            info!("Recovery pass complete: {}", stats);
        } else {
            debug!("Recovery pass found no expired leases");
        }
        Ok(stats)
    }
}
