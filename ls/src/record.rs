//! Persisted entity records and embedded leases

use serde::{Deserialize, Serialize};
use std::fmt;

/// Optimistic-concurrency version of an entity's payload.
///
/// `Version::ABSENT` (0) is the expected version for a key that does not
/// exist yet; the first successful write produces version 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub u64);

impl Version {
    /// Sentinel for "no such entity"
    pub const ABSENT: Version = Version(0);

    pub fn is_absent(self) -> bool {
        self == Self::ABSENT
    }

    /// The version following this one
    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self {
        Version(v)
    }
}

/// Exclusive, time-bounded ownership of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Worker holding the lease
    pub owner: String,
    /// Opaque token, unique per grant
    pub token: String,
    /// Absolute expiry (Unix milliseconds)
    pub expires_at: i64,
}

impl Lease {
    /// Grant a new lease with a fresh token
    pub fn grant(owner: impl Into<String>, expires_at: i64) -> Self {
        Self {
            owner: owner.into(),
            token: uuid::Uuid::now_v7().to_string(),
            expires_at,
        }
    }

    /// A lease is expired the instant `now >= expires_at`
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_active(&self, now_ms: i64) -> bool {
        !self.is_expired(now_ms)
    }

    /// Expiry as a UTC timestamp, for display
    pub fn expires_at_utc(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.expires_at)
    }
}

/// One persisted row: payload, version, revision guard and embedded lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Unique key
    pub key: String,

    /// Opaque payload
    pub payload: Vec<u8>,

    /// Payload version, bumped by every successful put
    pub version: Version,

    /// Write counter, bumped by every record write (payload or lease).
    /// Backends compare-and-swap on this value.
    pub revision: u64,

    /// Lease descriptor, stored with the entity for atomicity
    pub lease: Option<Lease>,

    /// Time of the last payload write (Unix milliseconds)
    #[serde(default)]
    pub updated_at: i64,
}

impl EntityRecord {
    /// A record as it is first inserted
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
            version: Version(1),
            revision: 1,
            lease: None,
            updated_at: 0,
        }
    }

    /// Stamp the time of a payload write
    pub(crate) fn written_at(mut self, now_ms: i64) -> Self {
        self.updated_at = now_ms;
        self
    }

    /// The lease if it is still within its validity window
    pub fn active_lease(&self, now_ms: i64) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.is_active(now_ms))
    }

    /// The lease if it has lapsed but was never cleared
    pub fn expired_lease(&self, now_ms: i64) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.is_expired(now_ms))
    }

    /// Copy of this record with the revision advanced, ready to be written
    pub(crate) fn next_revision(&self) -> Self {
        Self {
            revision: self.revision + 1,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expires_at_boundary() {
        let lease = Lease::grant("worker-1", 1_000);
        assert!(lease.is_active(999));
        assert!(lease.is_expired(1_000));
        assert!(lease.is_expired(1_001));
    }

    #[test]
    fn test_grant_issues_unique_tokens() {
        let a = Lease::grant("worker-1", 1_000);
        let b = Lease::grant("worker-1", 1_000);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_active_and_expired_lease() {
        let mut record = EntityRecord::new("job-1", b"A".to_vec());
        assert!(record.active_lease(0).is_none());

        record.lease = Some(Lease::grant("worker-1", 500));
        assert!(record.active_lease(100).is_some());
        assert!(record.expired_lease(100).is_none());
        assert!(record.active_lease(500).is_none());
        assert!(record.expired_lease(500).is_some());
    }

    #[test]
    fn test_version_sentinel() {
        assert!(Version::ABSENT.is_absent());
        assert_eq!(Version::ABSENT.next(), Version(1));
        assert_eq!(EntityRecord::new("k", vec![]).version, Version(1));
    }

    #[test]
    fn test_next_revision_keeps_contents() {
        let record = EntityRecord::new("k", b"x".to_vec());
        let next = record.next_revision();
        assert_eq!(next.revision, 2);
        assert_eq!(next.payload, record.payload);
        assert_eq!(next.version, record.version);
    }
}
