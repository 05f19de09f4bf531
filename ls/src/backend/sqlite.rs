//! SQLite backend
//!
//! One row per entity with the lease embedded in the same row, so lease and
//! payload writes share a single conditional statement. Several processes may
//! open the same database file; the `WHERE revision = ?` guard is what keeps
//! them consistent.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use super::{CasOutcome, Store};
use crate::error::{StoreError, StoreResult};
use crate::record::{EntityRecord, Lease, Version};

/// Default time a writer waits on a locked database before giving up
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entities (
    key          TEXT PRIMARY KEY NOT NULL,
    payload      BLOB NOT NULL,
    version      INTEGER NOT NULL,
    revision     INTEGER NOT NULL,
    lease_owner  TEXT,
    lease_token  TEXT,
    lease_expiry INTEGER,
    updated_at   INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_entities_lease_expiry ON entities (lease_expiry);
"#;

const SELECT_COLUMNS: &str = "key, payload, version, revision, lease_owner, lease_token, lease_expiry, updated_at";

/// Durable store backed by a SQLite database file
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open with a custom busy timeout
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::StoreUnavailable(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        debug!(%mode, "journal mode set");
        conn.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "Opened sqlite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        debug!("Opened in-memory sqlite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".to_string()))
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntityRecord> {
    let owner: Option<String> = row.get(4)?;
    let token: Option<String> = row.get(5)?;
    let expiry: Option<i64> = row.get(6)?;
    let lease = match (owner, token, expiry) {
        (Some(owner), Some(token), Some(expires_at)) => Some(Lease {
            owner,
            token,
            expires_at,
        }),
        _ => None,
    };

    Ok(EntityRecord {
        key: row.get(0)?,
        payload: row.get(1)?,
        version: Version(row.get::<_, i64>(2)? as u64),
        revision: row.get::<_, i64>(3)? as u64,
        lease,
        updated_at: row.get(7)?,
    })
}

fn outcome(changed: usize) -> CasOutcome {
    if changed == 0 {
        CasOutcome::Stale
    } else {
        CasOutcome::Applied
    }
}

impl Store for SqliteStore {
    fn load(&self, key: &str) -> StoreResult<Option<EntityRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                &format!("SELECT {} FROM entities WHERE key = ?1", SELECT_COLUMNS),
                params![key],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn insert(&self, record: &EntityRecord) -> StoreResult<CasOutcome> {
        let conn = self.conn()?;
        let lease = record.lease.as_ref();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO entities
                (key, payload, version, revision, lease_owner, lease_token, lease_expiry, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.key,
                record.payload,
                record.version.0 as i64,
                record.revision as i64,
                lease.map(|l| l.owner.as_str()),
                lease.map(|l| l.token.as_str()),
                lease.map(|l| l.expires_at),
                record.updated_at,
            ],
        )?;
        debug!(key = %record.key, changed, "insert: executed");
        Ok(outcome(changed))
    }

    fn replace(&self, record: &EntityRecord, expected_revision: u64) -> StoreResult<CasOutcome> {
        let conn = self.conn()?;
        let lease = record.lease.as_ref();
        let changed = conn.execute(
            "UPDATE entities
             SET payload = ?2, version = ?3, revision = ?4,
                 lease_owner = ?5, lease_token = ?6, lease_expiry = ?7, updated_at = ?9
             WHERE key = ?1 AND revision = ?8",
            params![
                record.key,
                record.payload,
                record.version.0 as i64,
                record.revision as i64,
                lease.map(|l| l.owner.as_str()),
                lease.map(|l| l.token.as_str()),
                lease.map(|l| l.expires_at),
                expected_revision as i64,
                record.updated_at,
            ],
        )?;
        debug!(key = %record.key, expected_revision, changed, "replace: executed");
        Ok(outcome(changed))
    }

    fn remove(&self, key: &str, expected_revision: u64) -> StoreResult<CasOutcome> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM entities WHERE key = ?1 AND revision = ?2",
            params![key, expected_revision as i64],
        )?;
        debug!(%key, expected_revision, changed, "remove: executed");
        Ok(outcome(changed))
    }

    fn scan(&self, prefix: Option<&str>) -> StoreResult<Vec<EntityRecord>> {
        let conn = self.conn()?;
        let records = match prefix {
            Some(prefix) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM entities WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                    SELECT_COLUMNS
                ))?;
                stmt.query_map(params![prefix], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("SELECT {} FROM entities ORDER BY key", SELECT_COLUMNS))?;
                stmt.query_map([], row_to_record)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(records)
    }

    fn scan_expired(&self, now_ms: i64) -> StoreResult<Vec<EntityRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entities
             WHERE lease_token IS NOT NULL AND lease_expiry <= ?1
             ORDER BY key",
            SELECT_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![now_ms], row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}
