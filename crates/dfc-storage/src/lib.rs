use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use dfc_core::audit::EnvelopeError;

mod audit;
mod claims;
mod legacy;
mod locks;
mod reconcile;
mod records;

pub use legacy::{ClaimMirror, MirrorEntry, DEFAULT_MIRROR_PATH};
pub use locks::BrokenBuild;

pub const COORD_SCHEMA_VERSION: i64 = 3;

/// Lease lifetime handed to `add_claim` when the caller does not override it.
pub const DEFAULT_CLAIM_TTL_SECS: i64 = 3600;
/// Lock lifetime handed to `lock_subdirectory` when the caller does not
/// override it.
pub const DEFAULT_LOCK_TTL_MINS: i64 = 30;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is busy: {0}")]
    Busy(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("audit envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) {
                return StorageError::Busy(err.to_string());
            }
        }
        StorageError::Sqlite(err)
    }
}

/// Handle on the coordination store. One per process; mutating operations
/// take `&mut self` so a handle has exactly one writer.
pub struct CoordStore {
    pub(crate) conn: Connection,
}

impl CoordStore {
    /// Opens (creating if needed) the file-backed store, applies pragmas and
    /// any pending migrations. Parent directories are created on demand.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_millis(busy_timeout_ms()))?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > COORD_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: COORD_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_coordination_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            tracing::debug!(version = 1, "applied migration");
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_canonical_identity.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
            tracing::debug!(version = 2, "applied migration");
            current = 2;
        }

        if current < 3 {
            let sql = include_str!("../migrations/0003_workspace_health.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 3", [])
                .map(|_| ())?;
            tracing::debug!(version = 3, "applied migration");
        }

        Ok(())
    }

    /// Consumes the handle, flushing and closing the underlying connection.
    pub fn close(self) -> Result<(), StorageError> {
        self.conn.close().map_err(|(_conn, err)| err.into())
    }
}

fn busy_timeout_ms() -> u64 {
    std::env::var("DFC_SQLITE_BUSY_MS")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS)
}

pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(format!("{raw}: {err}")))
}

pub(crate) fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StorageError> {
    raw.as_deref().map(parse_ts).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn table_exists(store: &CoordStore, name: &str) -> bool {
        store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?1",
                [name],
                |row| row.get::<_, i64>(0),
            )
            .expect("query sqlite_master")
            > 0
    }

    #[test]
    fn migrate_creates_all_tables_and_views() {
        let store = CoordStore::open_in_memory().expect("open db");
        assert_eq!(store.schema_version().expect("version"), COORD_SCHEMA_VERSION);
        for name in [
            "functions",
            "claims",
            "audit_log",
            "scratches",
            "agents",
            "match_history",
            "sync_state",
            "meta",
            "function_aliases",
            "subdirectory_locks",
            "agent_workspaces",
            "v_active_claims",
            "v_uncommitted_matches",
            "v_stale_data",
            "v_agent_summary",
        ] {
            assert!(table_exists(&store, name), "missing {name}");
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = CoordStore::open_in_memory().expect("open db");
        store.migrate().expect("second migrate");
        assert_eq!(store.schema_version().expect("version"), COORD_SCHEMA_VERSION);
    }

    #[test]
    fn reopening_a_file_store_preserves_schema() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let store = CoordStore::open(file.path()).expect("open db");
            assert_eq!(store.schema_version().expect("version"), COORD_SCHEMA_VERSION);
            store.close().expect("close db");
        }
        let store = CoordStore::open(file.path()).expect("reopen db");
        assert_eq!(store.schema_version().expect("version"), COORD_SCHEMA_VERSION);
        assert!(table_exists(&store, "subdirectory_locks"));
    }

    #[test]
    fn newer_schema_versions_are_refused() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("raw connection");
            conn.execute("PRAGMA user_version = 99", [])
                .expect("set version");
        }
        match CoordStore::open(file.path()) {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, COORD_SCHEMA_VERSION);
            }
            Ok(_) => panic!("expected version refusal"),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn timestamps_round_trip_with_millis_and_z() {
        let stamp = ts(9, 30);
        let raw = fmt_ts(stamp);
        assert!(raw.ends_with('Z'));
        assert_eq!(parse_ts(&raw).expect("parse"), stamp);
        // Same shape SQLite emits: lexicographic order is chronological.
        assert!(fmt_ts(ts(9, 31)) > raw);
    }
}
