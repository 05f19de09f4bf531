//! StoreManager - actor that owns the lease store components
//!
//! Processes commands via channels for ordered, thread-safe access to the store.

use std::sync::Arc;
use std::time::Duration;

use leasestore::{
    Clock, Entity, EntityStore, Lease, LeaseManager, RecoveryScanner, RecoveryStats, Store, SystemClock, Version,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{ServiceError, ServiceResponse, StoreCommand};

/// Handle to send commands to the StoreManager
#[derive(Clone)]
pub struct StoreManager {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreManager {
    /// Spawn a new StoreManager actor over the given backend
    pub fn spawn(store: Arc<dyn Store>) -> Self {
        Self::spawn_with_clock(store, Arc::new(SystemClock))
    }

    /// Spawn with an explicit clock (tests drive expiry by hand)
    pub fn spawn_with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        debug!("spawn_with_clock: called");
        let components = Components {
            entities: EntityStore::with_clock(store.clone(), clock.clone()),
            leases: LeaseManager::with_clock(store.clone(), clock.clone()),
            scanner: RecoveryScanner::with_clock(store, clock),
        };

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(components, rx));

        info!("StoreManager spawned");
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<ServiceResponse<T>>) -> StoreCommand,
    ) -> ServiceResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| ServiceError::ChannelError)?;
        reply_rx.await.map_err(|_| ServiceError::ChannelError)?
    }

    // === Lease operations ===

    /// Acquire the lease on `key` for `owner`
    pub async fn acquire(&self, key: &str, owner: &str, duration: Duration) -> ServiceResponse<Lease> {
        debug!(%key, %owner, ?duration, "acquire: called");
        self.request(|reply| StoreCommand::Acquire {
            key: key.to_string(),
            owner: owner.to_string(),
            duration,
            reply,
        })
        .await
    }

    /// Extend a held lease
    pub async fn renew(&self, key: &str, token: &str, duration: Duration) -> ServiceResponse<Lease> {
        debug!(%key, ?duration, "renew: called");
        self.request(|reply| StoreCommand::Renew {
            key: key.to_string(),
            token: token.to_string(),
            duration,
            reply,
        })
        .await
    }

    /// Give up a held lease
    pub async fn release(&self, key: &str, token: &str) -> ServiceResponse<()> {
        debug!(%key, "release: called");
        self.request(|reply| StoreCommand::Release {
            key: key.to_string(),
            token: token.to_string(),
            reply,
        })
        .await
    }

    /// The active lease on `key`, if any
    pub async fn current(&self, key: &str) -> ServiceResponse<Option<Lease>> {
        debug!(%key, "current: called");
        self.request(|reply| StoreCommand::Current {
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Fetch an entity and lease it in one step
    pub async fn get_and_acquire(&self, key: &str, owner: &str, duration: Duration) -> ServiceResponse<(Entity, Lease)> {
        debug!(%key, %owner, ?duration, "get_and_acquire: called");
        self.request(|reply| StoreCommand::GetAndAcquire {
            key: key.to_string(),
            owner: owner.to_string(),
            duration,
            reply,
        })
        .await
    }

    /// Claim up to `limit` unleased entities
    pub async fn claim(
        &self,
        owner: &str,
        limit: usize,
        duration: Duration,
        prefix: Option<String>,
    ) -> ServiceResponse<Vec<(String, Lease)>> {
        debug!(%owner, limit, ?prefix, "claim: called");
        self.request(|reply| StoreCommand::Claim {
            owner: owner.to_string(),
            limit,
            duration,
            prefix,
            reply,
        })
        .await
    }

    // === Entity operations ===

    pub async fn get(&self, key: &str) -> ServiceResponse<Entity> {
        debug!(%key, "get: called");
        self.request(|reply| StoreCommand::Get {
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Write a payload, optionally guarded by a lease token
    pub async fn put(
        &self,
        key: &str,
        payload: Vec<u8>,
        expected: Version,
        token: Option<String>,
    ) -> ServiceResponse<Version> {
        debug!(%key, %expected, leased = token.is_some(), "put: called");
        self.request(|reply| StoreCommand::Put {
            key: key.to_string(),
            payload,
            expected,
            token,
            reply,
        })
        .await
    }

    /// Delete an entity, optionally as the lease holder
    pub async fn delete(&self, key: &str, expected: Version, token: Option<String>) -> ServiceResponse<()> {
        debug!(%key, %expected, leased = token.is_some(), "delete: called");
        self.request(|reply| StoreCommand::Delete {
            key: key.to_string(),
            expected,
            token,
            reply,
        })
        .await
    }

    pub async fn list(&self, prefix: Option<String>) -> ServiceResponse<Vec<Entity>> {
        debug!(?prefix, "list: called");
        self.request(|reply| StoreCommand::List { prefix, reply }).await
    }

    // === Recovery ===

    /// Run one recovery pass
    pub async fn scan(&self) -> ServiceResponse<RecoveryStats> {
        debug!("scan: called");
        self.request(|reply| StoreCommand::Scan { reply }).await
    }

    /// Stop the actor
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        debug!("shutdown: called");
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| ServiceError::ChannelError)
    }
}

struct Components {
    entities: EntityStore,
    leases: LeaseManager,
    scanner: RecoveryScanner,
}

/// The actor loop that processes commands
async fn actor_loop(components: Components, mut rx: mpsc::Receiver<StoreCommand>) {
    debug!("StoreManager actor started");
    let Components {
        entities,
        leases,
        scanner,
    } = components;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::Acquire {
                key,
                owner,
                duration,
                reply,
            } => {
                debug!(%key, %owner, "actor_loop: Acquire command");
                let _ = reply.send(leases.acquire(&key, &owner, duration).map_err(Into::into));
            }

            StoreCommand::Renew {
                key,
                token,
                duration,
                reply,
            } => {
                debug!(%key, "actor_loop: Renew command");
                let _ = reply.send(leases.renew(&key, &token, duration).map_err(Into::into));
            }

            StoreCommand::Release { key, token, reply } => {
                debug!(%key, "actor_loop: Release command");
                let _ = reply.send(leases.release(&key, &token).map_err(Into::into));
            }

            StoreCommand::Current { key, reply } => {
                debug!(%key, "actor_loop: Current command");
                let _ = reply.send(leases.current(&key).map_err(Into::into));
            }

            StoreCommand::GetAndAcquire {
                key,
                owner,
                duration,
                reply,
            } => {
                debug!(%key, %owner, "actor_loop: GetAndAcquire command");
                let _ = reply.send(leases.get_and_acquire(&key, &owner, duration).map_err(Into::into));
            }

            StoreCommand::Claim {
                owner,
                limit,
                duration,
                prefix,
                reply,
            } => {
                debug!(%owner, limit, "actor_loop: Claim command");
                let result = leases.next_not_leased(&owner, limit, duration, prefix.as_deref());
                let _ = reply.send(result.map_err(Into::into));
            }

            StoreCommand::Get { key, reply } => {
                debug!(%key, "actor_loop: Get command");
                let _ = reply.send(entities.get(&key).map_err(Into::into));
            }

            StoreCommand::Put {
                key,
                payload,
                expected,
                token,
                reply,
            } => {
                debug!(%key, %expected, "actor_loop: Put command");
                let result = match token {
                    Some(token) => entities.put_leased(&key, payload, expected, &token),
                    None => entities.put(&key, payload, expected),
                };
                let _ = reply.send(result.map_err(Into::into));
            }

            StoreCommand::Delete {
                key,
                expected,
                token,
                reply,
            } => {
                debug!(%key, %expected, "actor_loop: Delete command");
                let result = match token {
                    Some(token) => entities.delete_leased(&key, expected, &token),
                    None => entities.delete(&key, expected),
                };
                let _ = reply.send(result.map_err(Into::into));
            }

            StoreCommand::List { prefix, reply } => {
                debug!(?prefix, "actor_loop: List command");
                let _ = reply.send(entities.list(prefix.as_deref()).map_err(Into::into));
            }

            StoreCommand::Scan { reply } => {
                debug!("actor_loop: Scan command");
                let result = scanner.scan_once();
                if let Err(e) = &result {
                    warn!(error = %e, "Recovery pass failed");
                }
                let _ = reply.send(result.map_err(Into::into));
            }

            StoreCommand::Shutdown => {
                info!("StoreManager shutting down");
                break;
            }
        }
    }

    debug!("StoreManager actor stopped");
}
