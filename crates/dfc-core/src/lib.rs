use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod audit;
pub mod identity;
pub mod policy;
pub mod workspace;

/// Lifecycle state of a tracked function.
///
/// `Merged`, `InReview`, `Committed` and `CommittedNeedsFix` are protected:
/// automatic sync from external match data never downgrades them (see
/// [`policy::derive_status`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FunctionStatus {
    Unclaimed,
    Claimed,
    InProgress,
    Matched,
    Committed,
    CommittedNeedsFix,
    Merged,
    InReview,
}

impl Default for FunctionStatus {
    fn default() -> Self {
        Self::Unclaimed
    }
}

impl FunctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionStatus::Unclaimed => "unclaimed",
            FunctionStatus::Claimed => "claimed",
            FunctionStatus::InProgress => "in_progress",
            FunctionStatus::Matched => "matched",
            FunctionStatus::Committed => "committed",
            FunctionStatus::CommittedNeedsFix => "committed_needs_fix",
            FunctionStatus::Merged => "merged",
            FunctionStatus::InReview => "in_review",
        }
    }

    /// Protected statuses survive automatic sync; only explicit transitions
    /// may change them.
    pub fn is_protected(&self) -> bool {
        matches!(
            self,
            FunctionStatus::Merged
                | FunctionStatus::InReview
                | FunctionStatus::Committed
                | FunctionStatus::CommittedNeedsFix
        )
    }
}

impl fmt::Display for FunctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FunctionStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "unclaimed" => Ok(FunctionStatus::Unclaimed),
            "claimed" => Ok(FunctionStatus::Claimed),
            "in_progress" | "in-progress" | "inprogress" => Ok(FunctionStatus::InProgress),
            "matched" => Ok(FunctionStatus::Matched),
            "committed" => Ok(FunctionStatus::Committed),
            "committed_needs_fix" | "committed-needs-fix" => Ok(FunctionStatus::CommittedNeedsFix),
            "merged" => Ok(FunctionStatus::Merged),
            "in_review" | "in-review" | "review" => Ok(FunctionStatus::InReview),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// Build health of a function's committed state. Absent means "unset".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Passing,
    Broken,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Passing => "passing",
            BuildStatus::Broken => "broken",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "passing" => Ok(BuildStatus::Passing),
            "broken" => Ok(BuildStatus::Broken),
            other => Err(format!("Unknown build status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DocumentationStatus {
    None,
    Partial,
    Complete,
}

impl DocumentationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentationStatus::None => "none",
            DocumentationStatus::Partial => "partial",
            DocumentationStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for DocumentationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentationStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "none" => Ok(DocumentationStatus::None),
            "partial" => Ok(DocumentationStatus::Partial),
            "complete" => Ok(DocumentationStatus::Complete),
            other => Err(format!("Unknown documentation status: {other}")),
        }
    }
}

/// Remote pull-request state, stored in the upstream's uppercase form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrState::Open => "OPEN",
            PrState::Closed => "CLOSED",
            PrState::Merged => "MERGED",
        }
    }
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_uppercase().as_str() {
            "OPEN" => Ok(PrState::Open),
            "CLOSED" => Ok(PrState::Closed),
            "MERGED" => Ok(PrState::Merged),
            other => Err(format!("Unknown PR state: {other}")),
        }
    }
}

/// Which compilation service instance a scratch lives on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScratchInstance {
    Local,
    Production,
}

impl ScratchInstance {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScratchInstance::Local => "local",
            ScratchInstance::Production => "production",
        }
    }
}

impl fmt::Display for ScratchInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScratchInstance {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "local" => Ok(ScratchInstance::Local),
            "production" => Ok(ScratchInstance::Production),
            other => Err(format!("Unknown scratch instance: {other}")),
        }
    }
}

/// How a rename alias was detected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AliasSource {
    ReportSync,
    Symbols,
    Manual,
    GitHistory,
}

impl AliasSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AliasSource::ReportSync => "report_sync",
            AliasSource::Symbols => "symbols",
            AliasSource::Manual => "manual",
            AliasSource::GitHistory => "git_history",
        }
    }
}

impl fmt::Display for AliasSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AliasSource {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "report_sync" | "report-sync" => Ok(AliasSource::ReportSync),
            "symbols" => Ok(AliasSource::Symbols),
            "manual" => Ok(AliasSource::Manual),
            "git_history" | "git-history" => Ok(AliasSource::GitHistory),
            other => Err(format!("Unknown alias source: {other}")),
        }
    }
}

/// Canonical status record for one tracked work item. Keyed by
/// `function_name`, which is mutable across the system's lifetime — only
/// `canonical_address` survives a rename.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionRecord {
    pub function_name: String,
    pub match_percent: f64,
    pub current_score: Option<i64>,
    pub max_score: Option<i64>,
    pub status: FunctionStatus,
    pub build_status: Option<BuildStatus>,
    pub build_diagnosis: Option<String>,
    pub documentation_status: Option<DocumentationStatus>,
    pub local_scratch_slug: Option<String>,
    pub production_scratch_slug: Option<String>,
    pub is_committed: bool,
    pub commit_hash: Option<String>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub pr_state: Option<PrState>,
    pub claimed_by_agent: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub source_file_path: Option<String>,
    pub canonical_address: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub local_scratch_verified_at: Option<DateTime<Utc>>,
    pub production_scratch_verified_at: Option<DateTime<Utc>>,
    pub git_verified_at: Option<DateTime<Utc>>,
}

impl FunctionRecord {
    /// Patch-shaped image of this record: every populated column present,
    /// every null column absent. Used as the pre-image in audit entries.
    pub fn to_patch(&self) -> FunctionPatch {
        FunctionPatch {
            match_percent: Some(self.match_percent),
            current_score: self.current_score,
            max_score: self.max_score,
            status: Some(self.status),
            build_status: self.build_status,
            build_diagnosis: self.build_diagnosis.clone(),
            documentation_status: self.documentation_status,
            local_scratch_slug: self.local_scratch_slug.clone(),
            production_scratch_slug: self.production_scratch_slug.clone(),
            is_committed: Some(self.is_committed),
            commit_hash: self.commit_hash.clone(),
            branch: self.branch.clone(),
            worktree_path: self.worktree_path.clone(),
            pr_url: self.pr_url.clone(),
            pr_number: self.pr_number,
            pr_state: self.pr_state,
            claimed_by_agent: self.claimed_by_agent.clone(),
            claimed_at: self.claimed_at,
            source_file_path: self.source_file_path.clone(),
            canonical_address: self.canonical_address.clone(),
            notes: self.notes.clone(),
            local_scratch_verified_at: self.local_scratch_verified_at,
            production_scratch_verified_at: self.production_scratch_verified_at,
            git_verified_at: self.git_verified_at,
        }
    }
}

/// Partial update for a function record. `None` leaves the column untouched;
/// there is no set-to-null through a patch — dedicated operations clear
/// fields. Doubles as the post-image in audit entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FunctionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<FunctionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_status: Option<BuildStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_diagnosis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_status: Option<DocumentationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_scratch_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_scratch_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_committed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_state: Option<PrState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_scratch_verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub production_scratch_verified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_verified_at: Option<DateTime<Utc>>,
}

impl FunctionPatch {
    pub fn is_empty(&self) -> bool {
        self == &FunctionPatch::default()
    }
}

/// A time-bounded exclusive reservation of one function by one agent.
/// Expiry is soft: the row stays until a later claim attempt observes it
/// expired.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Lease {
    pub function_name: String,
    pub agent_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Row of the active-claims view: a live lease joined with its function's
/// match state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveClaim {
    pub function_name: String,
    pub agent_id: String,
    pub claimed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub minutes_remaining: f64,
    pub match_percent: Option<f64>,
    pub local_scratch_slug: Option<String>,
}

/// A shared workspace region and its lock state. The row persists after
/// unlock so `pending_commits` and history survive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubdirectoryLock {
    pub subdirectory_key: String,
    pub worktree_path: String,
    pub branch_name: String,
    pub locked_by_agent: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub pending_commits: i64,
    pub last_commit_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SubdirectoryLock {
    /// The agent currently holding a live lock, if any. Expiry is evaluated
    /// here, at access time.
    pub fn holder(&self, now: DateTime<Utc>) -> Option<&str> {
        match (&self.locked_by_agent, self.lock_expires_at) {
            (Some(agent), Some(expires)) if expires > now => Some(agent.as_str()),
            _ => None,
        }
    }

    /// A lock that names a holder but whose expiry has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.locked_by_agent.is_some() && self.holder(now).is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScratchRecord {
    pub slug: String,
    pub function_name: Option<String>,
    pub instance: ScratchInstance,
    pub base_url: String,
    pub owner_agent: Option<String>,
    pub score: Option<i64>,
    pub max_score: Option<i64>,
    pub match_percent: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub last_compiled_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Partial update for a scratch record, same `None`-leaves-untouched rule as
/// [`FunctionPatch`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScratchPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRecord {
    pub agent_id: String,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSummary {
    pub agent_id: String,
    pub worktree_path: Option<String>,
    pub branch_name: Option<String>,
    pub last_active_at: Option<DateTime<Utc>>,
    pub active_claims: i64,
    pub committed_functions: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionAlias {
    pub canonical_address: String,
    pub old_name: String,
    pub new_name: Option<String>,
    pub renamed_at: DateTime<Utc>,
    pub source: AliasSource,
}

/// Which per-source timestamp went stale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaleKind {
    LocalScratch,
    ProductionScratch,
    Git,
}

impl StaleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StaleKind::LocalScratch => "local_scratch",
            StaleKind::ProductionScratch => "production_scratch",
            StaleKind::Git => "git",
        }
    }
}

impl FromStr for StaleKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "local_scratch" => Ok(StaleKind::LocalScratch),
            "production_scratch" => Ok(StaleKind::ProductionScratch),
            "git" => Ok(StaleKind::Git),
            other => Err(format!("Unknown stale kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaleEntry {
    pub function_name: String,
    pub stale_type: StaleKind,
    pub last_verified: Option<DateTime<Utc>>,
    pub hours_stale: f64,
}

/// Outcome of a claim attempt. Contention is data, not an error: callers
/// branch on the variant and present the holder to the operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ClaimOutcome {
    /// Fresh lease inserted.
    Acquired { expires_at: DateTime<Utc> },
    /// The caller already holds a live lease; idempotent success, expiry
    /// unchanged.
    AlreadyYours { expires_at: DateTime<Utc> },
    /// Someone else holds a live lease.
    HeldByOther {
        holder: String,
        expires_at: DateTime<Utc>,
    },
    /// Admission control: the routed workspace has accumulated too many
    /// broken builds.
    WorkspaceUnhealthy {
        workspace: String,
        broken_functions: Vec<String>,
    },
}

impl ClaimOutcome {
    /// True when the caller holds the lease after the call.
    pub fn succeeded(&self) -> bool {
        matches!(
            self,
            ClaimOutcome::Acquired { .. } | ClaimOutcome::AlreadyYours { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Released { holder: String },
    NotClaimed,
    NotOwner { holder: String },
}

impl ReleaseOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, ReleaseOutcome::NotOwner { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LockOutcome {
    Acquired { expires_at: DateTime<Utc> },
    /// Re-lock by the current holder: expiry pushed forward.
    Extended { expires_at: DateTime<Utc> },
    HeldByOther {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl LockOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, LockOutcome::HeldByOther { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UnlockOutcome {
    Unlocked,
    NotOwner { holder: String },
}

impl UnlockOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, UnlockOutcome::Unlocked)
    }
}

/// Outcome of a merge/rename. The no-op variants are sentinels, not errors:
/// the store is left exactly as it was.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MergeOutcome {
    /// Destination existed; null fields were filled from the source, the
    /// source row deleted, an alias written.
    Merged {
        into: String,
        copied_fields: Vec<String>,
    },
    /// Destination did not exist; the record moved wholesale to the new key.
    Renamed { to: String },
    /// The address would not normalize; nothing was touched.
    InvalidAddress,
    /// No record at the source name; nothing was touched.
    UnknownSource,
}

impl MergeOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. } | MergeOutcome::Renamed { .. })
    }
}

/// One externally-computed build-report fact, keyed by reported name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportFact {
    pub match_percent: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<identity::AddressValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchUpdate {
    pub function_name: String,
    pub old_percent: f64,
    pub new_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub function_name: String,
    pub old_status: FunctionStatus,
    pub new_status: FunctionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenameDetected {
    pub old_name: String,
    pub new_name: String,
    pub canonical_address: String,
}

/// Classification of a build report against the store, produced by
/// `reconcile_report`. `applied` records whether the changes were folded in
/// or merely reported.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconcileSummary {
    pub match_updates: Vec<MatchUpdate>,
    pub status_updates: Vec<StatusUpdate>,
    pub renames: Vec<RenameDetected>,
    pub new_functions: Vec<String>,
    pub missing_in_report: Vec<String>,
    pub applied: bool,
}

/// Remote PR facts folded into a function record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PrFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PrState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_decision: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            FunctionStatus::Unclaimed,
            FunctionStatus::Claimed,
            FunctionStatus::InProgress,
            FunctionStatus::Matched,
            FunctionStatus::Committed,
            FunctionStatus::CommittedNeedsFix,
            FunctionStatus::Merged,
            FunctionStatus::InReview,
        ] {
            assert_eq!(status.as_str().parse::<FunctionStatus>(), Ok(status));
        }
    }

    #[test]
    fn protected_statuses_match_policy() {
        assert!(FunctionStatus::Merged.is_protected());
        assert!(FunctionStatus::InReview.is_protected());
        assert!(FunctionStatus::Committed.is_protected());
        assert!(FunctionStatus::CommittedNeedsFix.is_protected());
        assert!(!FunctionStatus::Matched.is_protected());
        assert!(!FunctionStatus::Claimed.is_protected());
    }

    #[test]
    fn patch_serialization_skips_absent_fields() {
        let patch = FunctionPatch {
            match_percent: Some(97.5),
            status: Some(FunctionStatus::Matched),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).expect("serialize patch");
        let object = json.as_object().expect("object");
        assert_eq!(object.len(), 2);
        assert_eq!(object["match_percent"], 97.5);
        assert_eq!(object["status"], "matched");
    }

    #[test]
    fn pr_state_uses_upstream_case() {
        assert_eq!(PrState::Merged.as_str(), "MERGED");
        assert_eq!("merged".parse::<PrState>(), Ok(PrState::Merged));
        assert_eq!(
            serde_json::to_value(PrState::Open).expect("serialize"),
            serde_json::Value::String("OPEN".to_string())
        );
    }

    #[test]
    fn lock_holder_is_evaluated_lazily() {
        let now = Utc::now();
        let lock = SubdirectoryLock {
            subdirectory_key: "ft-chara-swordfighter".to_string(),
            worktree_path: String::new(),
            branch_name: String::new(),
            locked_by_agent: Some("agent-7".to_string()),
            locked_at: Some(now - chrono::Duration::minutes(40)),
            lock_expires_at: Some(now - chrono::Duration::minutes(10)),
            pending_commits: 2,
            last_commit_at: None,
            updated_at: now,
        };
        assert_eq!(lock.holder(now), None);
        assert!(lock.is_expired(now));
        assert_eq!(
            lock.holder(now - chrono::Duration::minutes(20)),
            Some("agent-7")
        );
    }
}
