//! Identity reconciliation: address-keyed lookup, rename detection, and the
//! merge that survives an external rename of a tracked function.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Transaction, TransactionBehavior};

use dfc_core::audit::{
    AliasChange, AuditAction, AuditMetadata, ChangeEnvelope, EntityChange, EntityKind,
    MetadataEnvelope,
};
use dfc_core::identity::{normalize_address, pr_number_from_url};
use dfc_core::{
    policy, AliasSource, FunctionAlias, FunctionPatch, FunctionRecord, FunctionStatus,
    MatchUpdate, MergeOutcome, PrFacts, PrState, ReconcileSummary, RenameDetected, ReportFact,
    StatusUpdate,
};

use crate::audit::{append_audit, AuditEvent};
use crate::records::{function_by_address, function_by_name, patch_columns};
use crate::{fmt_ts, parse_ts, CoordStore, StorageError};

/// Fields worth carrying across a merge: artifact references, commit and PR
/// linkage, notes. Everything else is either derived or stale by definition.
const MERGE_FIELDS: [&str; 9] = [
    "local_scratch_slug",
    "production_scratch_slug",
    "commit_hash",
    "branch",
    "worktree_path",
    "pr_url",
    "pr_number",
    "pr_state",
    "notes",
];

impl CoordStore {
    pub fn get_function_by_address(
        &self,
        address: &str,
    ) -> Result<Option<FunctionRecord>, StorageError> {
        let Some(canonical) = normalize_address(address) else {
            return Ok(None);
        };
        function_by_address(&self.conn, &canonical)
    }

    /// Exact-name lookup first, address as fallback. The disambiguation rule
    /// for names reported by an external source: a hit by address under a
    /// different name means the function was renamed out from under us.
    pub fn get_function_by_name_or_address(
        &self,
        name: Option<&str>,
        address: Option<&str>,
    ) -> Result<Option<FunctionRecord>, StorageError> {
        if let Some(name) = name {
            if let Some(record) = function_by_name(&self.conn, name)? {
                return Ok(Some(record));
            }
        }
        if let Some(address) = address {
            return self.get_function_by_address(address);
        }
        Ok(None)
    }

    /// Records that `old_name` is (or was) a name for the function at this
    /// address. Returns false without touching anything when the address
    /// will not normalize.
    pub fn record_function_alias(
        &mut self,
        address: &str,
        old_name: &str,
        new_name: Option<&str>,
        source: AliasSource,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(canonical) = normalize_address(address) else {
            return Ok(false);
        };
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        record_alias(&tx, &canonical, old_name, new_name, source, now)?;
        tx.commit()?;
        Ok(true)
    }

    /// Known names for an address, newest first.
    pub fn get_aliases_for_address(
        &self,
        address: &str,
    ) -> Result<Vec<FunctionAlias>, StorageError> {
        let Some(canonical) = normalize_address(address) else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "
            SELECT old_name, new_name, renamed_at, source
            FROM function_aliases
            WHERE canonical_address = ?1
            ORDER BY renamed_at DESC, old_name
            ",
        )?;
        let rows = stmt.query_map(params![canonical], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut aliases = Vec::new();
        for row in rows {
            let (old_name, new_name, renamed_at, source) = row?;
            aliases.push(FunctionAlias {
                canonical_address: canonical.clone(),
                old_name,
                new_name,
                renamed_at: parse_ts(&renamed_at)?,
                source: source
                    .parse::<AliasSource>()
                    .map_err(StorageError::Serialization)?,
            });
        }
        Ok(aliases)
    }

    /// Folds the record at `old_name` into `new_name`.
    ///
    /// When a record already exists at the new name, valuable fields move
    /// across only where the destination is null, the old row is deleted,
    /// and an alias ties the names together. When nothing exists at the new
    /// name this is a pure rename: the row is reinserted under the new key
    /// because the name is the primary key and other tables reference it by
    /// string, not by a surrogate id.
    pub fn merge_function_records(
        &mut self,
        old_name: &str,
        new_name: &str,
        address: &str,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, StorageError> {
        let Some(canonical) = normalize_address(address) else {
            return Ok(MergeOutcome::InvalidAddress);
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(old_record) = function_by_name(&tx, old_name)? else {
            return Ok(MergeOutcome::UnknownSource);
        };
        let new_record = function_by_name(&tx, new_name)?;

        record_alias(
            &tx,
            &canonical,
            old_name,
            Some(new_name),
            AliasSource::ReportSync,
            now,
        )?;

        let outcome = if let Some(new_record) = new_record {
            let old_patch = old_record.to_patch();
            let new_patch = new_record.to_patch();
            let mut copy = FunctionPatch::default();
            let mut copied_fields = Vec::new();
            for field in MERGE_FIELDS {
                if field_of(&new_patch, field).is_some() {
                    continue;
                }
                if let Some(value) = field_of(&old_patch, field) {
                    set_field(&mut copy, field, value);
                    copied_fields.push(field.to_string());
                }
            }
            copy.canonical_address = Some(canonical.clone());

            let cols = patch_columns(&copy);
            let mut sets: Vec<String> = cols
                .iter()
                .enumerate()
                .map(|(index, (column, _))| format!("{column} = ?{}", index + 1))
                .collect();
            let mut binds: Vec<Value> = cols.into_iter().map(|(_, value)| value).collect();
            sets.push(format!("updated_at = ?{}", binds.len() + 1));
            binds.push(Value::Text(fmt_ts(now)));
            binds.push(Value::Text(new_name.to_string()));
            let sql = format!(
                "UPDATE functions SET {} WHERE function_name = ?{}",
                sets.join(", "),
                binds.len(),
            );
            tx.execute(&sql, params_from_iter(binds))?;
            tx.execute(
                "DELETE FROM functions WHERE function_name = ?1",
                params![old_name],
            )?;

            let mut event = AuditEvent::new(EntityKind::Function, old_name, AuditAction::Merged)
                .old(ChangeEnvelope::new(EntityChange::Function(old_patch)))
                .new_state(ChangeEnvelope::new(EntityChange::Function(copy)))
                .metadata(MetadataEnvelope::new(AuditMetadata::Merge {
                    canonical_address: canonical.clone(),
                    into: new_name.to_string(),
                    copied_fields: copied_fields.clone(),
                }));
            if let Some(agent) = agent {
                event = event.agent(agent);
            }
            append_audit(&tx, event, now)?;

            MergeOutcome::Merged {
                into: new_name.to_string(),
                copied_fields,
            }
        } else {
            tx.execute(
                "
                INSERT INTO functions (
                    function_name, match_percent, current_score, max_score, status,
                    build_status, build_diagnosis, documentation_status, local_scratch_slug,
                    production_scratch_slug, is_committed, commit_hash, branch, worktree_path,
                    pr_url, pr_number, pr_state, claimed_by_agent, claimed_at, source_file_path,
                    canonical_address, notes, created_at, updated_at, local_scratch_verified_at,
                    production_scratch_verified_at, git_verified_at
                )
                SELECT
                    ?1, match_percent, current_score, max_score, status,
                    build_status, build_diagnosis, documentation_status, local_scratch_slug,
                    production_scratch_slug, is_committed, commit_hash, branch, worktree_path,
                    pr_url, pr_number, pr_state, claimed_by_agent, claimed_at, source_file_path,
                    ?2, notes, created_at, ?3, local_scratch_verified_at,
                    production_scratch_verified_at, git_verified_at
                FROM functions WHERE function_name = ?4
                ",
                params![new_name, canonical, fmt_ts(now), old_name],
            )?;
            tx.execute(
                "DELETE FROM functions WHERE function_name = ?1",
                params![old_name],
            )?;

            let mut event = AuditEvent::new(EntityKind::Function, old_name, AuditAction::Renamed)
                .old(ChangeEnvelope::new(EntityChange::Function(
                    old_record.to_patch(),
                )))
                .metadata(MetadataEnvelope::new(AuditMetadata::Rename {
                    canonical_address: canonical.clone(),
                    to: new_name.to_string(),
                }));
            if let Some(agent) = agent {
                event = event.agent(agent);
            }
            append_audit(&tx, event, now)?;

            MergeOutcome::Renamed {
                to: new_name.to_string(),
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Folds a symbol-table parse into existing records. Unparsable
    /// addresses and rows already carrying the address are skipped; one
    /// audit entry summarizes the batch.
    pub fn bulk_update_addresses(
        &mut self,
        addresses: &BTreeMap<String, String>,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        if addresses.is_empty() {
            return Ok(0);
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut updated = 0u64;
        for (function, address) in addresses {
            let Some(canonical) = normalize_address(address) else {
                continue;
            };
            let changed = tx.execute(
                "
                UPDATE functions SET canonical_address = ?1, updated_at = ?2
                WHERE function_name = ?3
                  AND (canonical_address IS NULL OR canonical_address != ?1)
                ",
                params![canonical, fmt_ts(now), function],
            )?;
            if changed > 0 {
                updated += 1;
            }
        }

        if updated > 0 {
            let mut event = AuditEvent::new(EntityKind::Function, "*", AuditAction::Updated)
                .metadata(MetadataEnvelope::new(AuditMetadata::BulkAddressUpdate {
                    updated,
                }));
            if let Some(agent) = agent {
                event = event.agent(agent);
            }
            append_audit(&tx, event, now)?;
        }

        tx.commit()?;
        Ok(updated)
    }

    /// Classifies a build report against the store and, in apply mode, folds
    /// it in through the ordinary audited operations.
    ///
    /// A name found in the store gets match and status updates. A name the
    /// store does not know, whose address maps to a tracked record, is a
    /// rename. Anything else in the report is a new function, and tracked
    /// names absent from the report are flagged as missing.
    pub fn reconcile_report(
        &mut self,
        facts: &BTreeMap<String, ReportFact>,
        agent: Option<&str>,
        apply: bool,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary, StorageError> {
        let tracked = self.get_all_functions()?;
        let by_name: BTreeMap<&str, &FunctionRecord> = tracked
            .iter()
            .map(|record| (record.function_name.as_str(), record))
            .collect();
        let mut address_to_name: BTreeMap<String, String> = BTreeMap::new();
        for record in &tracked {
            if let Some(address) = &record.canonical_address {
                address_to_name.insert(address.clone(), record.function_name.clone());
            }
        }

        let mut summary = ReconcileSummary::default();
        for (name, fact) in facts {
            if let Some(record) = by_name.get(name.as_str()) {
                if (record.match_percent - fact.match_percent).abs() > 0.01 {
                    summary.match_updates.push(MatchUpdate {
                        function_name: name.clone(),
                        old_percent: record.match_percent,
                        new_percent: fact.match_percent,
                    });
                }
                let derived = policy::derive_status(
                    record.status,
                    fact.match_percent,
                    record.is_committed,
                    record.pr_state,
                );
                if let Some(new_status) = derived {
                    if new_status != record.status {
                        summary.status_updates.push(StatusUpdate {
                            function_name: name.clone(),
                            old_status: record.status,
                            new_status,
                        });
                    }
                }
                continue;
            }

            let known = fact
                .address
                .as_ref()
                .and_then(|address| address.normalize())
                .and_then(|canonical| {
                    address_to_name
                        .get(&canonical)
                        .map(|old| (old.clone(), canonical))
                });
            if let Some((old_name, canonical)) = known {
                summary.renames.push(RenameDetected {
                    old_name,
                    new_name: name.clone(),
                    canonical_address: canonical,
                });
            } else {
                summary.new_functions.push(name.clone());
            }
        }
        for record in &tracked {
            if !facts.contains_key(&record.function_name) {
                summary.missing_in_report.push(record.function_name.clone());
            }
        }

        if !apply {
            return Ok(summary);
        }

        let mut patches: BTreeMap<String, FunctionPatch> = BTreeMap::new();
        for update in &summary.match_updates {
            patches
                .entry(update.function_name.clone())
                .or_default()
                .match_percent = Some(update.new_percent);
        }
        for update in &summary.status_updates {
            patches
                .entry(update.function_name.clone())
                .or_default()
                .status = Some(update.new_status);
        }
        for (name, patch) in &patches {
            self.upsert_function(name, patch, agent, now)?;
        }
        for rename in &summary.renames {
            self.merge_function_records(
                &rename.old_name,
                &rename.new_name,
                &rename.canonical_address,
                agent,
                now,
            )?;
        }
        for name in &summary.new_functions {
            let fact = &facts[name];
            let mut patch = FunctionPatch {
                match_percent: Some(fact.match_percent),
                ..Default::default()
            };
            if let Some(address) = &fact.address {
                patch.canonical_address = address.normalize();
            }
            patch.status =
                policy::derive_status(FunctionStatus::Unclaimed, fact.match_percent, false, None);
            self.upsert_function(name, &patch, agent, now)?;
        }
        summary.applied = true;
        Ok(summary)
    }

    /// Folds remote PR facts into a record and returns the status they
    /// imply. A merged PR pins `merged`, an open one `in_review`; a closed
    /// PR re-derives from the remaining evidence.
    pub fn apply_pr_facts(
        &mut self,
        function: &str,
        facts: &PrFacts,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FunctionStatus, StorageError> {
        let current = self.get_function(function)?;
        let current_status = current.as_ref().map(|r| r.status).unwrap_or_default();

        let mut patch = FunctionPatch {
            pr_url: facts.url.clone(),
            pr_number: facts
                .number
                .or_else(|| facts.url.as_deref().and_then(pr_number_from_url)),
            pr_state: facts.state,
            ..Default::default()
        };

        let status = match facts.state {
            Some(PrState::Merged) => FunctionStatus::Merged,
            Some(PrState::Open) => FunctionStatus::InReview,
            Some(PrState::Closed) => {
                let (percent, committed, build) = current
                    .as_ref()
                    .map(|r| (r.match_percent, r.is_committed, r.build_status))
                    .unwrap_or((0.0, false, None));
                policy::expected_status(percent, committed, build, Some(PrState::Closed))
            }
            None => current_status,
        };
        if status != current_status || current.is_none() {
            patch.status = Some(status);
        }
        self.upsert_function(function, &patch, agent, now)?;
        Ok(status)
    }
}

fn record_alias(
    tx: &Transaction<'_>,
    canonical: &str,
    old_name: &str,
    new_name: Option<&str>,
    source: AliasSource,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    tx.execute(
        "
        INSERT INTO function_aliases (canonical_address, old_name, new_name, renamed_at, source)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(canonical_address, old_name) DO UPDATE SET
            new_name = COALESCE(excluded.new_name, new_name),
            source = excluded.source
        ",
        params![canonical, old_name, new_name, fmt_ts(now), source.as_str()],
    )?;
    append_audit(
        tx,
        AuditEvent::new(EntityKind::Alias, old_name, AuditAction::Recorded).new_state(
            ChangeEnvelope::new(EntityChange::Alias(AliasChange {
                canonical_address: canonical.to_string(),
                old_name: old_name.to_string(),
                new_name: new_name.map(str::to_string),
                source,
            })),
        ),
        now,
    )?;
    Ok(())
}

fn field_of(patch: &FunctionPatch, field: &str) -> Option<Value> {
    match field {
        "local_scratch_slug" => patch.local_scratch_slug.clone().map(Value::Text),
        "production_scratch_slug" => patch.production_scratch_slug.clone().map(Value::Text),
        "commit_hash" => patch.commit_hash.clone().map(Value::Text),
        "branch" => patch.branch.clone().map(Value::Text),
        "worktree_path" => patch.worktree_path.clone().map(Value::Text),
        "pr_url" => patch.pr_url.clone().map(Value::Text),
        "pr_number" => patch.pr_number.map(Value::Integer),
        "pr_state" => patch
            .pr_state
            .map(|state| Value::Text(state.as_str().to_string())),
        "notes" => patch.notes.clone().map(Value::Text),
        _ => None,
    }
}

fn set_field(patch: &mut FunctionPatch, field: &str, value: Value) {
    match (field, value) {
        ("local_scratch_slug", Value::Text(v)) => patch.local_scratch_slug = Some(v),
        ("production_scratch_slug", Value::Text(v)) => patch.production_scratch_slug = Some(v),
        ("commit_hash", Value::Text(v)) => patch.commit_hash = Some(v),
        ("branch", Value::Text(v)) => patch.branch = Some(v),
        ("worktree_path", Value::Text(v)) => patch.worktree_path = Some(v),
        ("pr_url", Value::Text(v)) => patch.pr_url = Some(v),
        ("pr_number", Value::Integer(v)) => patch.pr_number = Some(v),
        ("pr_state", Value::Text(v)) => patch.pr_state = v.parse().ok(),
        ("notes", Value::Text(v)) => patch.notes = Some(v),
        _ => {}
    }
}
