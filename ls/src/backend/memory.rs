//! In-memory backend

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use super::{CasOutcome, Store};
use crate::error::{StoreError, StoreResult};
use crate::record::EntityRecord;

/// Process-local store; contents are lost on drop
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, EntityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> StoreResult<MutexGuard<'_, BTreeMap<String, EntityRecord>>> {
        self.records
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn load(&self, key: &str) -> StoreResult<Option<EntityRecord>> {
        Ok(self.records()?.get(key).cloned())
    }

    fn insert(&self, record: &EntityRecord) -> StoreResult<CasOutcome> {
        let mut records = self.records()?;
        if records.contains_key(&record.key) {
            debug!(key = %record.key, "insert: key exists");
            return Ok(CasOutcome::Stale);
        }
        records.insert(record.key.clone(), record.clone());
        Ok(CasOutcome::Applied)
    }

    fn replace(&self, record: &EntityRecord, expected_revision: u64) -> StoreResult<CasOutcome> {
        let mut records = self.records()?;
        match records.get_mut(&record.key) {
            Some(stored) if stored.revision == expected_revision => {
                *stored = record.clone();
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Stale),
        }
    }

    fn remove(&self, key: &str, expected_revision: u64) -> StoreResult<CasOutcome> {
        let mut records = self.records()?;
        match records.get(key) {
            Some(stored) if stored.revision == expected_revision => {
                records.remove(key);
                Ok(CasOutcome::Applied)
            }
            _ => Ok(CasOutcome::Stale),
        }
    }

    fn scan(&self, prefix: Option<&str>) -> StoreResult<Vec<EntityRecord>> {
        let records = self.records()?;
        Ok(records
            .values()
            .filter(|r| prefix.is_none_or(|p| r.key.starts_with(p)))
            .cloned()
            .collect())
    }

    fn scan_expired(&self, now_ms: i64) -> StoreResult<Vec<EntityRecord>> {
        let records = self.records()?;
        Ok(records
            .values()
            .filter(|r| r.expired_lease(now_ms).is_some())
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::conformance;
    use super::*;

    #[test]
    fn test_insert_then_load() {
        conformance::insert_then_load(&MemoryStore::new());
    }

    #[test]
    fn test_replace_checks_revision() {
        conformance::replace_checks_revision(&MemoryStore::new());
    }

    #[test]
    fn test_remove_checks_revision() {
        conformance::remove_checks_revision(&MemoryStore::new());
    }

    #[test]
    fn test_scan_by_prefix() {
        conformance::scan_by_prefix(&MemoryStore::new());
    }

    #[test]
    fn test_scan_expired_filters_leases() {
        conformance::scan_expired_filters_leases(&MemoryStore::new());
    }
}
