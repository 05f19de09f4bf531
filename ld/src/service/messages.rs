//! Store manager messages
//!
//! Commands and responses for the actor pattern.

use std::time::Duration;

use leasestore::{Entity, Lease, RecoveryStats, StoreError, Version};
use thiserror::Error;
use tokio::sync::oneshot;

/// Errors from service operations
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Channel error")]
    ChannelError,
}

/// Response from service operations
pub type ServiceResponse<T> = Result<T, ServiceError>;

/// Commands sent to the StoreManager actor
#[derive(Debug)]
pub enum StoreCommand {
    // Lease operations
    Acquire {
        key: String,
        owner: String,
        duration: Duration,
        reply: oneshot::Sender<ServiceResponse<Lease>>,
    },
    Renew {
        key: String,
        token: String,
        duration: Duration,
        reply: oneshot::Sender<ServiceResponse<Lease>>,
    },
    Release {
        key: String,
        token: String,
        reply: oneshot::Sender<ServiceResponse<()>>,
    },
    Current {
        key: String,
        reply: oneshot::Sender<ServiceResponse<Option<Lease>>>,
    },
    GetAndAcquire {
        key: String,
        owner: String,
        duration: Duration,
        reply: oneshot::Sender<ServiceResponse<(Entity, Lease)>>,
    },
    Claim {
        owner: String,
        limit: usize,
        duration: Duration,
        prefix: Option<String>,
        reply: oneshot::Sender<ServiceResponse<Vec<(String, Lease)>>>,
    },

    // Entity operations
    Get {
        key: String,
        reply: oneshot::Sender<ServiceResponse<Entity>>,
    },
    Put {
        key: String,
        payload: Vec<u8>,
        expected: Version,
        /// When set, the write is refused unless this token holds the lease
        token: Option<String>,
        reply: oneshot::Sender<ServiceResponse<Version>>,
    },
    Delete {
        key: String,
        expected: Version,
        /// When set, only the lease holder may delete
        token: Option<String>,
        reply: oneshot::Sender<ServiceResponse<()>>,
    },
    List {
        prefix: Option<String>,
        reply: oneshot::Sender<ServiceResponse<Vec<Entity>>>,
    },

    // Recovery
    Scan {
        reply: oneshot::Sender<ServiceResponse<RecoveryStats>>,
    },

    // Shutdown
    Shutdown,
}
