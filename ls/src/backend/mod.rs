//! Persistence backends
//!
//! A backend stores whole [`EntityRecord`]s and offers compare-and-swap on
//! the record revision. It knows nothing about versions or leases; those
//! rules are enforced by [`crate::EntityStore`] and [`crate::LeaseManager`].

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use tracing::debug;

use crate::MAX_CAS_ATTEMPTS;
use crate::error::{StoreError, StoreResult};
use crate::record::EntityRecord;

/// Result of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write was applied
    Applied,
    /// The precondition no longer held; nothing was written
    Stale,
}

impl CasOutcome {
    pub fn is_applied(self) -> bool {
        self == CasOutcome::Applied
    }
}

/// The durable store capability shared by all components
pub trait Store: Send + Sync {
    /// Read one record
    fn load(&self, key: &str) -> StoreResult<Option<EntityRecord>>;

    /// Create a record; `Stale` if the key already exists
    fn insert(&self, record: &EntityRecord) -> StoreResult<CasOutcome>;

    /// Overwrite a record; `Stale` unless its stored revision is `expected_revision`
    fn replace(&self, record: &EntityRecord, expected_revision: u64) -> StoreResult<CasOutcome>;

    /// Delete a record; `Stale` unless its stored revision is `expected_revision`
    fn remove(&self, key: &str, expected_revision: u64) -> StoreResult<CasOutcome>;

    /// All records, optionally restricted to a key prefix, ordered by key
    fn scan(&self, prefix: Option<&str>) -> StoreResult<Vec<EntityRecord>>;

    /// Records carrying a lease that expired at or before `now_ms`
    fn scan_expired(&self, now_ms: i64) -> StoreResult<Vec<EntityRecord>>;
}

/// Read-modify-write of one existing record.
///
/// `apply` sees the current record and returns the record to write plus a
/// value for the caller; the revision is advanced here. When another writer
/// got in first, the record is re-read and `apply` runs again, so every rule
/// it checks is evaluated against the state the write actually replaces.
pub(crate) fn update_existing<T>(
    store: &dyn Store,
    key: &str,
    mut apply: impl FnMut(&EntityRecord) -> StoreResult<(EntityRecord, T)>,
) -> StoreResult<T> {
    for attempt in 0..MAX_CAS_ATTEMPTS {
        let current = store.load(key)?.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let (mut next, value) = apply(&current)?;
        next.revision = current.revision + 1;

        if store.replace(&next, current.revision)?.is_applied() {
            return Ok(value);
        }
        debug!(%key, attempt, "update_existing: stale revision, retrying");
    }

    Err(contended(key))
}

/// Error reported when a key stays contended for every attempt
pub(crate) fn contended(key: &str) -> StoreError {
    StoreError::StoreUnavailable(format!("{} is contended, retry later", key))
}
