//! LeaseStore - durable lease-based work-item store
//!
//! Workers claim exclusive, time-bounded ownership of stored entities,
//! mutate them with optimistic concurrency, and let abandoned work come back
//! through lease expiry instead of explicit cancellation.
//!
//! # Architecture
//!
//! ```text
//! LeaseManager ─┐
//! EntityStore ──┼──> Arc<dyn Store> ──> MemoryStore | SqliteStore
//! RecoveryScanner┘
//! ```
//!
//! Every component takes the [`Store`] capability explicitly. Backends only
//! know how to compare-and-swap whole records on their revision; the
//! version and lease rules live in the components above them.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use leasestore::{EntityStore, LeaseManager, SqliteStore, Version};
//!
//! let store = Arc::new(SqliteStore::open("store.db")?);
//! let entities = EntityStore::new(store.clone());
//! let leases = LeaseManager::new(store);
//!
//! let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT)?;
//! let lease = leases.acquire("job-1", "worker-1", Duration::from_secs(30))?;
//! entities.put_leased("job-1", b"B".to_vec(), v1, &lease.token)?;
//! leases.release("job-1", &lease.token)?;
//! ```

pub mod backend;
pub mod clock;
mod entity;
mod error;
mod lease;
mod record;
mod recovery;

pub use backend::{CasOutcome, MemoryStore, SqliteStore, Store};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{Entity, EntityStore};
pub use error::{StoreError, StoreResult};
pub use lease::LeaseManager;
pub use record::{EntityRecord, Lease, Version};
pub use recovery::{RecoveryScanner, RecoveryStats};

/// Default lease duration (30 seconds)
pub const DEFAULT_LEASE_SECS: u64 = 30;

/// Attempts made by a read-modify-write cycle before reporting contention
pub(crate) const MAX_CAS_ATTEMPTS: usize = 16;
