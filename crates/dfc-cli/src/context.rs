//! Per-invocation command context: store location, agent identity, tuning
//! knobs. Everything here comes from flags or environment, resolved once.

use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dfc_core::workspace::subdirectory_key;
use dfc_storage::{ClaimMirror, CoordStore, DEFAULT_CLAIM_TTL_SECS, DEFAULT_LOCK_TTL_MINS};

pub struct CliContext {
    pub store_path: PathBuf,
    pub agent_id: String,
    pub claim_ttl_secs: i64,
    pub lock_ttl_mins: i64,
    tree_root: Option<String>,
}

impl CliContext {
    pub fn new() -> Result<Self> {
        let store_path = resolve_store_path()?;
        let agent_id = default_agent_id();
        let claim_ttl_secs = env_i64("DFC_CLAIM_TIMEOUT", DEFAULT_CLAIM_TTL_SECS);
        let lock_ttl_mins = env_i64("DFC_LOCK_TTL_MINS", DEFAULT_LOCK_TTL_MINS);
        let tree_root = env::var("DFC_TREE_ROOT")
            .ok()
            .filter(|root| !root.trim().is_empty());
        Ok(Self {
            store_path,
            agent_id,
            claim_ttl_secs,
            lock_ttl_mins,
            tree_root,
        })
    }

    pub fn open_store(&self) -> Result<CoordStore> {
        CoordStore::open(&self.store_path).with_context(|| {
            format!(
                "opening coordination store at {}",
                self.store_path.display()
            )
        })
    }

    pub fn mirror(&self) -> ClaimMirror {
        ClaimMirror::from_env()
    }

    /// Agent identity: explicit flag first, then `DFC_AGENT_ID`, then the
    /// `$USER-<pid>` fallback resolved at startup.
    pub fn resolve_agent(&self, override_agent: Option<&str>) -> String {
        match override_agent {
            Some(agent) if !agent.trim().is_empty() => agent.to_string(),
            _ => self.agent_id.clone(),
        }
    }

    /// Workspace key for a lock argument: source paths are reduced to their
    /// key, bare keys pass through unchanged.
    pub fn workspace_key(&self, raw: &str) -> String {
        if raw.contains('/') {
            self.subdirectory_for(raw)
        } else {
            raw.to_string()
        }
    }

    pub fn subdirectory_for(&self, source_file: &str) -> String {
        subdirectory_key(source_file, self.tree_root.as_deref())
    }
}

fn resolve_store_path() -> Result<PathBuf> {
    if let Ok(path) = env::var("DFC_DB_PATH") {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let base = dirs::config_dir().context("no config directory for the default store path")?;
    Ok(base.join("decomp-fleet").join("agent_state.db"))
}

fn default_agent_id() -> String {
    if let Ok(agent) = env::var("DFC_AGENT_ID") {
        if !agent.trim().is_empty() {
            return agent;
        }
    }
    let user = env::var("USER").unwrap_or_else(|_| "agent".to_string());
    format!("{user}-{}", std::process::id())
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
