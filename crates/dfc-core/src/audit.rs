use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::{AliasSource, FunctionPatch, ScratchInstance};

/// Version written into every envelope. Readers refuse anything newer.
pub const ENVELOPE_SCHEMA: u32 = 1;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("audit envelope is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("audit envelope has no schema version")]
    MissingVersion,
    #[error("audit envelope schema {found} is newer than supported schema {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// What happened, as a closed vocabulary. One action per audit row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Updated,
    Deleted,
    Released,
    Extended,
    Locked,
    Unlocked,
    Renamed,
    Merged,
    Recorded,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Updated => "updated",
            AuditAction::Deleted => "deleted",
            AuditAction::Released => "released",
            AuditAction::Extended => "extended",
            AuditAction::Locked => "locked",
            AuditAction::Unlocked => "unlocked",
            AuditAction::Renamed => "renamed",
            AuditAction::Merged => "merged",
            AuditAction::Recorded => "recorded",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "created" => Ok(AuditAction::Created),
            "updated" => Ok(AuditAction::Updated),
            "deleted" => Ok(AuditAction::Deleted),
            "released" => Ok(AuditAction::Released),
            "extended" => Ok(AuditAction::Extended),
            "locked" => Ok(AuditAction::Locked),
            "unlocked" => Ok(AuditAction::Unlocked),
            "renamed" => Ok(AuditAction::Renamed),
            "merged" => Ok(AuditAction::Merged),
            "recorded" => Ok(AuditAction::Recorded),
            other => Err(format!("Unknown audit action: {other}")),
        }
    }
}

/// Which table an audit row is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Function,
    Claim,
    SubdirectoryLock,
    Alias,
    Scratch,
    Agent,
    Sync,
    Meta,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Function => "function",
            EntityKind::Claim => "claim",
            EntityKind::SubdirectoryLock => "subdirectory_lock",
            EntityKind::Alias => "alias",
            EntityKind::Scratch => "scratch",
            EntityKind::Agent => "agent",
            EntityKind::Sync => "sync",
            EntityKind::Meta => "meta",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "function" => Ok(EntityKind::Function),
            "claim" => Ok(EntityKind::Claim),
            "subdirectory_lock" => Ok(EntityKind::SubdirectoryLock),
            "alias" => Ok(EntityKind::Alias),
            "scratch" => Ok(EntityKind::Scratch),
            "agent" => Ok(EntityKind::Agent),
            "sync" => Ok(EntityKind::Sync),
            "meta" => Ok(EntityKind::Meta),
            other => Err(format!("Unknown entity kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClaimChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LockChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_commits: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AliasChange {
    pub canonical_address: String,
    pub old_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    pub source: AliasSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScratchChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<ScratchInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_compiled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<ScratchInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetaChange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

/// The per-entity payload of an audit envelope. Internally tagged so the
/// stored JSON names its entity alongside the change fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityChange {
    Function(FunctionPatch),
    Claim(ClaimChange),
    SubdirectoryLock(LockChange),
    Alias(AliasChange),
    Scratch(ScratchChange),
    Agent(AgentChange),
    Sync(SyncChange),
    Meta(MetaChange),
}

/// Versioned wrapper stored in `old_value`/`new_value`. The schema field is
/// checked before the payload is decoded, so a newer writer fails loudly
/// instead of decoding garbage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEnvelope {
    pub schema: u32,
    #[serde(flatten)]
    pub change: EntityChange,
}

impl ChangeEnvelope {
    pub fn new(change: EntityChange) -> Self {
        Self {
            schema: ENVELOPE_SCHEMA,
            change,
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        check_schema(&value)?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Extra context that is neither a pre- nor post-image, stored in the
/// `metadata` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditMetadata {
    Merge {
        canonical_address: String,
        into: String,
        copied_fields: Vec<String>,
    },
    Rename {
        canonical_address: String,
        to: String,
    },
    BulkAddressUpdate {
        updated: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataEnvelope {
    pub schema: u32,
    #[serde(flatten)]
    pub metadata: AuditMetadata,
}

impl MetadataEnvelope {
    pub fn new(metadata: AuditMetadata) -> Self {
        Self {
            schema: ENVELOPE_SCHEMA,
            metadata,
        }
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        check_schema(&value)?;
        Ok(serde_json::from_value(value)?)
    }
}

fn check_schema(value: &serde_json::Value) -> Result<u32, EnvelopeError> {
    let found = value
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or(EnvelopeError::MissingVersion)? as u32;
    if found > ENVELOPE_SCHEMA {
        return Err(EnvelopeError::UnsupportedVersion {
            found,
            supported: ENVELOPE_SCHEMA,
        });
    }
    Ok(found)
}

/// One row of the append-only log. The JSON columns are kept raw; the typed
/// accessors decode on demand so a malformed historical row surfaces exactly
/// where it is read.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub action: AuditAction,
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub metadata: Option<String>,
}

impl AuditEntry {
    pub fn old_change(&self) -> Result<Option<ChangeEnvelope>, EnvelopeError> {
        self.old_value
            .as_deref()
            .map(ChangeEnvelope::from_json)
            .transpose()
    }

    pub fn new_change(&self) -> Result<Option<ChangeEnvelope>, EnvelopeError> {
        self.new_value
            .as_deref()
            .map(ChangeEnvelope::from_json)
            .transpose()
    }

    pub fn metadata_change(&self) -> Result<Option<MetadataEnvelope>, EnvelopeError> {
        self.metadata
            .as_deref()
            .map(MetadataEnvelope::from_json)
            .transpose()
    }
}
