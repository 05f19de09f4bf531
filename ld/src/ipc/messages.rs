//! IPC message types for daemon communication
//!
//! JSON-over-newline protocol. Each message is a single line of JSON followed by `\n`.

use leasestore::{Entity, Lease, RecoveryStats, StoreError, Version};
use serde::{Deserialize, Serialize};

/// Requests from workers and the CLI to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Request {
    /// Take exclusive ownership of an entity
    AcquireLease {
        key: String,
        owner: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
    },

    RenewLease {
        key: String,
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
    },

    ReleaseLease { key: String, token: String },

    /// Inspect the active lease on an entity
    GetLease { key: String },

    /// Fetch an entity and lease it in one step
    GetAndLease {
        key: String,
        owner: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
    },

    GetEntity { key: String },

    /// Conditional write; with `token` the write also requires holding the lease
    PutEntity {
        key: String,
        payload: Vec<u8>,
        expected_version: Version,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Conditional delete; a leased entity needs the holder's `token`
    DeleteEntity {
        key: String,
        expected_version: Version,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    ListEntities {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },

    /// Claim a batch of entities nobody holds
    ClaimBatch {
        owner: String,
        limit: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },

    /// Run a recovery pass now
    Scan,

    /// Ping to check if daemon is alive
    Ping,

    /// Request daemon to stop gracefully
    Shutdown,
}

/// One entity claimed by a batch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimedLease {
    pub key: String,
    pub lease: Lease,
}

/// Responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Response {
    /// Acknowledgment
    Ok,

    /// Pong response to ping
    Pong { version: String },

    /// A freshly granted lease
    Lease(Lease),

    Renewed { expires_at: i64 },

    CurrentLease { lease: Option<Lease> },

    /// An entity together with the lease just granted on it
    Leased { entity: Entity, lease: Lease },

    Entity(Entity),

    /// Version assigned by a write
    Version { version: Version },

    Entities { entities: Vec<Entity> },

    Claimed { leases: Vec<ClaimedLease> },

    Stats(RecoveryStats),

    /// A store operation failed; the error keeps its kind and details
    StoreError { error: StoreError },

    /// Anything else went wrong (bad request, daemon shutting down)
    Error { message: String },
}
