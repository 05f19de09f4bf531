//! Lease Manager - exclusive, time-bounded ownership of entities
//!
//! Leases live inside the entity record and are written with the same
//! revision-guarded replace as payloads. Expiry is never signalled; a lease
//! simply stops counting once `now >= expires_at`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::backend::{Store, update_existing};
use crate::clock::{Clock, SystemClock, duration_ms};
use crate::error::{StoreError, StoreResult};
use crate::entity::Entity;
use crate::record::{EntityRecord, Lease};

/// Grants, renews and releases leases
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Acquire a lease on an existing entity.
    ///
    /// Succeeds when no active lease exists or the active lease already
    /// belongs to `owner`; either way a fresh token is issued.
    pub fn acquire(&self, key: &str, owner: &str, duration: Duration) -> StoreResult<Lease> {
        debug!(%key, %owner, ?duration, "acquire: called");
        let (_, lease) = self.lease_record(key, owner, duration)?;
        info!(%key, %owner, expires_at = lease.expires_at, "Lease acquired");
        Ok(lease)
    }

    /// Fetch an entity and lease it in the same conditional write.
    ///
    /// Same rules as [`LeaseManager::acquire`]; the returned entity is the
    /// state the lease was granted on.
    pub fn get_and_acquire(&self, key: &str, owner: &str, duration: Duration) -> StoreResult<(Entity, Lease)> {
        debug!(%key, %owner, ?duration, "get_and_acquire: called");
        let (record, lease) = self.lease_record(key, owner, duration)?;
        info!(%key, %owner, expires_at = lease.expires_at, "Entity fetched and leased");
        Ok((Entity::from(record), lease))
    }

    fn lease_record(&self, key: &str, owner: &str, duration: Duration) -> StoreResult<(EntityRecord, Lease)> {
        let now = self.clock.now_ms();

        update_existing(self.store.as_ref(), key, |current| {
            if let Some(held) = current.active_lease(now)
                && held.owner != owner
            {
                return Err(StoreError::LeaseConflict {
                    key: key.to_string(),
                    owner: held.owner.clone(),
                    expires_at: held.expires_at,
                });
            }

            let lease = Lease::grant(owner, now.saturating_add(duration_ms(duration)));
            let mut next = current.clone();
            next.lease = Some(lease.clone());
            Ok((next.clone(), (next, lease)))
        })
    }

    /// Extend the lease identified by `token` to `now + duration`
    pub fn renew(&self, key: &str, token: &str, duration: Duration) -> StoreResult<Lease> {
        debug!(%key, ?duration, "renew: called");
        let now = self.clock.now_ms();

        let lease = update_existing(self.store.as_ref(), key, |current| {
            let held = current
                .active_lease(now)
                .filter(|l| l.token == token)
                .ok_or_else(|| StoreError::InvalidToken(key.to_string()))?;

            let lease = Lease {
                expires_at: now.saturating_add(duration_ms(duration)),
                ..held.clone()
            };
            let mut next = current.clone();
            next.lease = Some(lease.clone());
            Ok((next, lease))
        })?;

        debug!(%key, expires_at = lease.expires_at, "renew: extended");
        Ok(lease)
    }

    /// Clear the lease identified by `token`, making the entity acquirable
    pub fn release(&self, key: &str, token: &str) -> StoreResult<()> {
        debug!(%key, "release: called");
        let now = self.clock.now_ms();

        update_existing(self.store.as_ref(), key, |current| {
            if current.active_lease(now).is_none_or(|l| l.token != token) {
                return Err(StoreError::InvalidToken(key.to_string()));
            }

            let mut next = current.clone();
            next.lease = None;
            Ok((next, ()))
        })?;

        info!(%key, "Lease released");
        Ok(())
    }

    /// The active lease on an entity, if any
    pub fn current(&self, key: &str) -> StoreResult<Option<Lease>> {
        let now = self.clock.now_ms();
        let record = self
            .store
            .load(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        Ok(record.active_lease(now).cloned())
    }

    /// Claim up to `limit` entities that nobody holds.
    ///
    /// The least recently written entities go first, ties in key order.
    /// Entities another worker claims first are skipped rather than failing
    /// the batch.
    pub fn next_not_leased(
        &self,
        owner: &str,
        limit: usize,
        duration: Duration,
        prefix: Option<&str>,
    ) -> StoreResult<Vec<(String, Lease)>> {
        debug!(%owner, limit, ?prefix, "next_not_leased: called");
        let now = self.clock.now_ms();
        let mut claimed = Vec::new();

        let mut candidates = self.store.scan(prefix)?;
        candidates.sort_by_key(|r| r.updated_at);

        for record in candidates {
            if claimed.len() >= limit {
                break;
            }
            if record.active_lease(now).is_some() {
                continue;
            }

            let key = record.key;
            let result = update_existing(self.store.as_ref(), &key, |current| {
                if let Some(held) = current.active_lease(now) {
                    return Err(StoreError::LeaseConflict {
                        key: key.clone(),
                        owner: held.owner.clone(),
                        expires_at: held.expires_at,
                    });
                }
                let lease = Lease::grant(owner, now.saturating_add(duration_ms(duration)));
                let mut next = current.clone();
                next.lease = Some(lease.clone());
                Ok((next, lease))
            });

            match result {
                Ok(lease) => claimed.push((key, lease)),
                Err(StoreError::LeaseConflict { .. } | StoreError::NotFound(_)) => {
                    debug!(%key, "next_not_leased: lost claim race, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        if !claimed.is_empty() {
            info!(%owner, count = claimed.len(), "Claimed unleased entities");
        }
        Ok(claimed)
    }
}
