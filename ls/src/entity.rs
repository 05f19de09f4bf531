//! Entity Store - versioned records with optimistic-concurrency writes

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::MAX_CAS_ATTEMPTS;
use crate::backend::{CasOutcome, Store, contended};
use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::record::{EntityRecord, Version};

/// An entity as seen by callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub payload: Vec<u8>,
    pub version: Version,
    /// Time of the last payload write (Unix milliseconds)
    #[serde(default)]
    pub updated_at: i64,
}

impl From<EntityRecord> for Entity {
    fn from(record: EntityRecord) -> Self {
        Self {
            key: record.key,
            payload: record.payload,
            version: record.version,
            updated_at: record.updated_at,
        }
    }
}

/// Reads and writes entity payloads.
///
/// While another worker holds an active lease, writes are refused with
/// `LeaseConflict`; the holder writes through the `*_leased` variants by
/// presenting its token.
#[derive(Clone)]
pub struct EntityStore {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl EntityStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Get an entity's payload and version
    pub fn get(&self, key: &str) -> StoreResult<Entity> {
        debug!(%key, "get: called");
        self.store
            .load(key)?
            .map(Entity::from)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// Write a payload if the stored version is still `expected`.
    ///
    /// Creating a key requires `Version::ABSENT`. Returns the new version.
    /// Fails with `LeaseConflict` while somebody holds the entity.
    pub fn put(&self, key: &str, payload: Vec<u8>, expected: Version) -> StoreResult<Version> {
        debug!(%key, %expected, len = payload.len(), "put: called");
        self.write(key, payload, expected, None)
    }

    /// Like [`EntityStore::put`], but only for the holder of the active lease.
    /// The lease is kept.
    pub fn put_leased(&self, key: &str, payload: Vec<u8>, expected: Version, token: &str) -> StoreResult<Version> {
        debug!(%key, %expected, "put_leased: called");
        self.write(key, payload, expected, Some(token))
    }

    /// Delete an entity if the stored version is still `expected`
    pub fn delete(&self, key: &str, expected: Version) -> StoreResult<()> {
        debug!(%key, %expected, "delete: called");
        self.remove(key, expected, None)
    }

    /// Delete a leased entity on behalf of the lease holder
    pub fn delete_leased(&self, key: &str, expected: Version, token: &str) -> StoreResult<()> {
        debug!(%key, %expected, "delete_leased: called");
        self.remove(key, expected, Some(token))
    }

    /// List entities, optionally restricted to a key prefix
    pub fn list(&self, prefix: Option<&str>) -> StoreResult<Vec<Entity>> {
        debug!(?prefix, "list: called");
        Ok(self.store.scan(prefix)?.into_iter().map(Entity::from).collect())
    }

    fn write(&self, key: &str, payload: Vec<u8>, expected: Version, token: Option<&str>) -> StoreResult<Version> {
        let now = self.clock.now_ms();

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let Some(current) = self.store.load(key)? else {
                if token.is_some() {
                    return Err(StoreError::NotFound(key.to_string()));
                }
                if !expected.is_absent() {
                    return Err(conflict(key, expected, Version::ABSENT));
                }

                let record = EntityRecord::new(key, payload.clone()).written_at(now);
                if self.store.insert(&record)? == CasOutcome::Applied {
                    info!(%key, "Created entity");
                    return Ok(record.version);
                }
                debug!(%key, attempt, "write: lost create race, re-reading");
                continue;
            };

            check_writer(&current, now, token)?;
            if current.version != expected {
                return Err(conflict(key, expected, current.version));
            }

            let mut next = current.next_revision().written_at(now);
            next.payload = payload.clone();
            next.version = current.version.next();

            if self.store.replace(&next, current.revision)?.is_applied() {
                debug!(%key, version = %next.version, "write: applied");
                return Ok(next.version);
            }
            debug!(%key, attempt, "write: stale revision, re-reading");
        }

        Err(contended(key))
    }

    fn remove(&self, key: &str, expected: Version, token: Option<&str>) -> StoreResult<()> {
        let now = self.clock.now_ms();

        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .load(key)?
                .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

            check_writer(&current, now, token)?;
            if current.version != expected {
                return Err(conflict(key, expected, current.version));
            }

            if self.store.remove(key, current.revision)?.is_applied() {
                info!(%key, version = %current.version, "Deleted entity");
                return Ok(());
            }
            debug!(%key, attempt, "remove: stale revision, re-reading");
        }

        Err(contended(key))
    }
}

/// Lease rule for payload writes. Without a token the entity must be free;
/// with one, the token must match the active lease.
fn check_writer(current: &EntityRecord, now: i64, token: Option<&str>) -> StoreResult<()> {
    match (current.active_lease(now), token) {
        (None, None) => Ok(()),
        (Some(held), None) => Err(StoreError::LeaseConflict {
            key: current.key.clone(),
            owner: held.owner.clone(),
            expires_at: held.expires_at,
        }),
        (Some(held), Some(token)) if held.token == token => Ok(()),
        (_, Some(_)) => Err(StoreError::InvalidToken(current.key.clone())),
    }
}

fn conflict(key: &str, expected: Version, actual: Version) -> StoreError {
    StoreError::VersionConflict {
        key: key.to_string(),
        expected,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryStore, SqliteStore};
    use crate::clock::ManualClock;
    use crate::lease::LeaseManager;
    use std::thread;
    use std::time::Duration;

    fn memory_entities() -> EntityStore {
        EntityStore::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_put_then_get_round_trip() {
        let entities = memory_entities();

        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();
        assert_eq!(v1, Version(1));

        let v2 = entities.put("job-1", b"B".to_vec(), v1).unwrap();
        assert_eq!(v2, Version(2));

        let entity = entities.get("job-1").unwrap();
        assert_eq!(entity.payload, b"B".to_vec());
        assert_eq!(entity.version, v2);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let err = memory_entities().get("nope").unwrap_err();
        assert_eq!(err, StoreError::NotFound("nope".to_string()));
    }

    #[test]
    fn test_create_requires_absent_sentinel() {
        let entities = memory_entities();

        let err = entities.put("job-1", b"A".to_vec(), Version(1)).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: Version(1),
                actual: Version::ABSENT,
                ..
            }
        ));

        entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();
        let err = entities.put("job-1", b"B".to_vec(), Version::ABSENT).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { actual: Version(1), .. }));
    }

    #[test]
    fn test_stale_put_is_rejected_and_payload_kept() {
        let entities = memory_entities();
        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();
        entities.put("job-1", b"B".to_vec(), v1).unwrap();

        let err = entities.put("job-1", b"C".to_vec(), v1).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert_eq!(entities.get("job-1").unwrap().payload, b"B".to_vec());
    }

    #[test]
    fn test_delete_checks_version() {
        let entities = memory_entities();
        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();

        let err = entities.delete("job-1", Version(9)).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        entities.delete("job-1", v1).unwrap();
        assert!(matches!(entities.get("job-1"), Err(StoreError::NotFound(_))));
        assert!(matches!(entities.delete("job-1", v1), Err(StoreError::NotFound(_))));

        // Recreate after delete starts from the sentinel again
        assert_eq!(entities.put("job-1", b"Z".to_vec(), Version::ABSENT).unwrap(), Version(1));
    }

    fn leased_fixture() -> (EntityStore, LeaseManager, Arc<ManualClock>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let entities = EntityStore::with_clock(store.clone(), clock.clone());
        let leases = LeaseManager::with_clock(store, clock.clone());
        (entities, leases, clock)
    }

    #[test]
    fn test_put_leased_preserves_lease() {
        let (entities, leases, _) = leased_fixture();

        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();
        let lease = leases.acquire("job-1", "worker-1", Duration::from_secs(30)).unwrap();

        // Acquiring does not move the payload version
        assert_eq!(entities.get("job-1").unwrap().version, v1);

        entities.put_leased("job-1", b"B".to_vec(), v1, &lease.token).unwrap();
        assert_eq!(leases.current("job-1").unwrap(), Some(lease));
    }

    #[test]
    fn test_put_leased_requires_active_token() {
        let (entities, leases, clock) = leased_fixture();

        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();

        let err = entities.put_leased("job-1", b"B".to_vec(), v1, "no-lease").unwrap_err();
        assert!(matches!(err, StoreError::InvalidToken(_)));

        let lease = leases.acquire("job-1", "worker-1", Duration::from_secs(30)).unwrap();
        let v2 = entities.put_leased("job-1", b"B".to_vec(), v1, &lease.token).unwrap();
        assert_eq!(v2, Version(2));

        // Token is worthless once the lease has lapsed
        clock.advance(Duration::from_secs(30));
        let err = entities.put_leased("job-1", b"C".to_vec(), v2, &lease.token).unwrap_err();
        assert!(matches!(err, StoreError::InvalidToken(_)));

        assert!(matches!(
            entities.put_leased("ghost", vec![], Version::ABSENT, &lease.token),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_non_holder_cannot_write_leased_entity() {
        let (entities, leases, clock) = leased_fixture();
        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();
        let lease = leases.acquire("job-1", "worker-1", Duration::from_secs(30)).unwrap();

        match entities.put("job-1", b"HIJACK".to_vec(), v1).unwrap_err() {
            StoreError::LeaseConflict { owner, expires_at, .. } => {
                assert_eq!(owner, "worker-1");
                assert_eq!(expires_at, lease.expires_at);
            }
            other => panic!("expected LeaseConflict, got {:?}", other),
        }
        assert!(matches!(
            entities.delete("job-1", v1),
            Err(StoreError::LeaseConflict { .. })
        ));
        assert!(matches!(
            entities.put_leased("job-1", b"HIJACK".to_vec(), v1, "forged"),
            Err(StoreError::InvalidToken(_))
        ));
        assert!(matches!(
            entities.delete_leased("job-1", v1, "forged"),
            Err(StoreError::InvalidToken(_))
        ));

        let entity = entities.get("job-1").unwrap();
        assert_eq!(entity.payload, b"A".to_vec());
        assert_eq!(entity.version, v1);

        // Once the lease lapses anyone may write again
        clock.advance(Duration::from_secs(30));
        assert_eq!(entities.put("job-1", b"B".to_vec(), v1).unwrap(), Version(2));
    }

    #[test]
    fn test_holder_deletes_with_token() {
        let (entities, leases, _) = leased_fixture();
        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();
        let lease = leases.acquire("job-1", "worker-1", Duration::from_secs(30)).unwrap();

        let err = entities.delete_leased("job-1", Version(9), &lease.token).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        entities.delete_leased("job-1", v1, &lease.token).unwrap();
        assert!(matches!(entities.get("job-1"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_writes_stamp_updated_at() {
        let (entities, leases, clock) = leased_fixture();
        clock.set(1_000);
        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();
        assert_eq!(entities.get("job-1").unwrap().updated_at, 1_000);

        // Lease changes are not payload writes
        clock.set(2_000);
        let lease = leases.acquire("job-1", "worker-1", Duration::from_secs(30)).unwrap();
        assert_eq!(entities.get("job-1").unwrap().updated_at, 1_000);

        clock.set(3_000);
        entities.put_leased("job-1", b"B".to_vec(), v1, &lease.token).unwrap();
        assert_eq!(entities.get("job-1").unwrap().updated_at, 3_000);
    }

    #[test]
    fn test_list_by_prefix() {
        let entities = memory_entities();
        for key in ["job-1", "job-2", "other"] {
            entities.put(key, key.as_bytes().to_vec(), Version::ABSENT).unwrap();
        }

        let jobs = entities.list(Some("job-")).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].key, "job-1");
        assert_eq!(entities.list(None).unwrap().len(), 3);
    }

    fn race_stale_puts(entities: EntityStore) {
        let v1 = entities.put("job-1", b"A".to_vec(), Version::ABSENT).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let entities = entities.clone();
                thread::spawn(move || entities.put("job-1", vec![i], v1))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(StoreError::VersionConflict { .. })))
            .count();

        assert_eq!(winners, 1);
        assert_eq!(conflicts, 7);
        assert_eq!(entities.get("job-1").unwrap().version, Version(2));
    }

    #[test]
    fn test_concurrent_stale_puts_memory() {
        race_stale_puts(memory_entities());
    }

    #[test]
    fn test_concurrent_stale_puts_sqlite() {
        let temp = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::open_with_timeout(temp.path().join("store.db"), Duration::from_secs(5)).unwrap();
        race_stale_puts(EntityStore::new(Arc::new(store)));
    }

    #[test]
    fn test_concurrent_creates_single_winner() {
        let entities = memory_entities();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let entities = entities.clone();
                thread::spawn(move || entities.put("fresh", vec![i], Version::ABSENT))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(winners, 1);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::backend::MemoryStore;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn versions_advance_by_one_per_successful_put(
            writes in proptest::collection::vec((any::<bool>(), proptest::collection::vec(any::<u8>(), 0..16)), 1..32)
        ) {
            let entities = EntityStore::new(Arc::new(MemoryStore::new()));
            let mut current = Version::ABSENT;

            for (stale, payload) in writes {
                let expected = if stale && !current.is_absent() { Version(current.0 - 1) } else { current };
                match entities.put("k", payload.clone(), expected) {
                    Ok(v) => {
                        prop_assert_eq!(v, current.next());
                        prop_assert_eq!(entities.get("k").unwrap().payload, payload);
                        current = v;
                    }
                    Err(StoreError::VersionConflict { actual, .. }) => {
                        prop_assert!(stale);
                        prop_assert_eq!(actual, current);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
            }
        }
    }
}
