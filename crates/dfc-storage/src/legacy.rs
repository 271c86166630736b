//! Flat-file lease mirror for callers that have not migrated to the store.
//!
//! The mirror is a single JSON object keyed by function name, shared across
//! machines' worth of agent shells via `/tmp`. It carries no authority: the
//! store is the source of truth, and the mirror may lag it by one write
//! cycle. Load-modify-save runs under an exclusive advisory lock on a
//! `.lock` sidecar so concurrent shells do not shred the file.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::{StorageError, DEFAULT_CLAIM_TTL_SECS};

pub const DEFAULT_MIRROR_PATH: &str = "/tmp/decomp_claims.json";

/// One mirrored lease, in the shape legacy shell readers expect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirrorEntry {
    pub agent_id: String,
    /// Epoch seconds with fractional part.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdirectory: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClaimMirror {
    path: PathBuf,
    ttl_secs: i64,
}

struct MirrorGuard {
    file: File,
}

impl MirrorGuard {
    fn acquire(mirror_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = mirror_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(sidecar_path(mirror_path, "lock"))?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for MirrorGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl ClaimMirror {
    pub fn new(path: impl Into<PathBuf>, ttl_secs: i64) -> Self {
        Self {
            path: path.into(),
            ttl_secs,
        }
    }

    pub fn from_env() -> Self {
        let path = std::env::var("DFC_CLAIMS_FILE")
            .unwrap_or_else(|_| DEFAULT_MIRROR_PATH.to_string());
        let ttl_secs = std::env::var("DFC_CLAIM_TIMEOUT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_CLAIM_TTL_SECS);
        Self::new(path, ttl_secs)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mirrors a fresh lease. Stale entries are dropped in the same pass.
    pub fn record(
        &self,
        function: &str,
        agent: &str,
        source_file: Option<&str>,
        subdirectory: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let _guard = MirrorGuard::acquire(&self.path)?;
        let mut entries = self.load(now);
        entries.insert(
            function.to_string(),
            MirrorEntry {
                agent_id: agent.to_string(),
                timestamp: epoch_seconds(now),
                source_file: source_file.map(str::to_string),
                subdirectory: subdirectory.map(str::to_string),
            },
        );
        self.save(&entries)
    }

    /// Drops a mirrored lease, returning what was there.
    pub fn remove(
        &self,
        function: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MirrorEntry>, StorageError> {
        let _guard = MirrorGuard::acquire(&self.path)?;
        let mut entries = self.load(now);
        let removed = entries.remove(function);
        self.save(&entries)?;
        Ok(removed)
    }

    /// Live entries as of `now`. Reads take no lock; the mirror is advisory
    /// and a torn read is no worse than a lagging one.
    pub fn entries(&self, now: DateTime<Utc>) -> BTreeMap<String, MirrorEntry> {
        self.load(now)
    }

    fn load(&self, now: DateTime<Utc>) -> BTreeMap<String, MirrorEntry> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "claim mirror unreadable, treating as empty"
                );
                return BTreeMap::new();
            }
        };
        let mut entries: BTreeMap<String, MirrorEntry> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %err,
                    "claim mirror corrupt, treating as empty"
                );
                return BTreeMap::new();
            }
        };
        let cutoff = epoch_seconds(now) - self.ttl_secs as f64;
        entries.retain(|_, entry| entry.timestamp > cutoff);
        entries
    }

    fn save(&self, entries: &BTreeMap<String, MirrorEntry>) -> Result<(), StorageError> {
        let payload = serde_json::to_string_pretty(entries)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let temp_path = sidecar_path(&self.path, "tmp");
        fs::write(&temp_path, payload)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn sidecar_path(path: &Path, suffix: &str) -> PathBuf {
    match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.{suffix}", name.to_string_lossy())),
        None => path.with_extension(suffix),
    }
}

fn epoch_seconds(now: DateTime<Utc>) -> f64 {
    now.timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn mirror_in(dir: &tempfile::TempDir) -> ClaimMirror {
        ClaimMirror::new(dir.path().join("decomp_claims.json"), 3600)
    }

    #[test]
    fn record_then_list_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mirror = mirror_in(&dir);

        mirror
            .record(
                "ftCa_Init",
                "agent-1",
                Some("melee/ft/chara/ftCaptain/ftCa_Init.c"),
                Some("ft-chara-ftCaptain"),
                ts(9, 0),
            )
            .expect("record");
        mirror
            .record("lb_Alloc", "agent-2", None, None, ts(9, 1))
            .expect("record second");

        let entries = mirror.entries(ts(9, 5));
        assert_eq!(entries.len(), 2);
        let entry = &entries["ftCa_Init"];
        assert_eq!(entry.agent_id, "agent-1");
        assert_eq!(
            entry.subdirectory.as_deref(),
            Some("ft-chara-ftCaptain")
        );

        // The on-disk shape is what legacy shell readers parse.
        let raw = fs::read_to_string(mirror.path()).expect("read mirror");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("parse mirror");
        let entry = &value["ftCa_Init"];
        assert_eq!(entry["agent_id"], "agent-1");
        assert!(entry["timestamp"].is_f64());
        assert!(value["lb_Alloc"]["source_file"].is_null());
    }

    #[test]
    fn stale_entries_drop_off_on_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mirror = mirror_in(&dir);

        mirror
            .record("fn_old", "agent-1", None, None, ts(9, 0))
            .expect("record old");
        mirror
            .record("fn_fresh", "agent-2", None, None, ts(10, 30))
            .expect("record fresh");

        // 9:00 + 1h TTL has lapsed by 10:59; 10:30 has not.
        let entries = mirror.entries(ts(10, 59));
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("fn_fresh"));

        // The next write rewrites the file without the stale entry.
        mirror
            .record("fn_another", "agent-3", None, None, ts(10, 59))
            .expect("record third");
        let raw = fs::read_to_string(mirror.path()).expect("read mirror");
        assert!(!raw.contains("fn_old"));
    }

    #[test]
    fn corrupt_mirrors_start_empty_instead_of_failing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mirror = mirror_in(&dir);
        fs::write(mirror.path(), "{not json").expect("write garbage");

        assert!(mirror.entries(ts(9, 0)).is_empty());
        mirror
            .record("fn_a", "agent-1", None, None, ts(9, 0))
            .expect("record over garbage");
        assert_eq!(mirror.entries(ts(9, 1)).len(), 1);
    }

    #[test]
    fn remove_returns_the_dropped_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mirror = mirror_in(&dir);
        mirror
            .record("fn_a", "agent-1", None, None, ts(9, 0))
            .expect("record");

        let removed = mirror.remove("fn_a", ts(9, 5)).expect("remove");
        assert_eq!(removed.expect("entry").agent_id, "agent-1");
        assert!(mirror.entries(ts(9, 6)).is_empty());
        assert_eq!(mirror.remove("fn_a", ts(9, 7)).expect("re-remove"), None);
    }

    #[test]
    fn writes_go_through_the_lock_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mirror = mirror_in(&dir);
        mirror
            .record("fn_a", "agent-1", None, None, ts(9, 0))
            .expect("record");
        assert!(dir.path().join("decomp_claims.json.lock").exists());
        assert!(!dir.path().join("decomp_claims.json.tmp").exists());
    }
}
