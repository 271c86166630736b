use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};

use dfc_core::audit::{
    AgentChange, AuditAction, ChangeEnvelope, EntityChange, EntityKind, MetaChange, ScratchChange,
    SyncChange,
};
use dfc_core::{
    AgentSummary, FunctionPatch, FunctionRecord, FunctionStatus, ScratchInstance, ScratchPatch,
    ScratchRecord, StaleEntry, StaleKind,
};

use crate::audit::{append_audit, AuditEvent};
use crate::{fmt_ts, parse_opt_ts, parse_ts, CoordStore, StorageError};

pub(crate) const FUNCTION_COLUMNS: &str = "function_name, match_percent, current_score, max_score,
    status, build_status, build_diagnosis, documentation_status, local_scratch_slug,
    production_scratch_slug, is_committed, commit_hash, branch, worktree_path, pr_url, pr_number,
    pr_state, claimed_by_agent, claimed_at, source_file_path, canonical_address, notes,
    created_at, updated_at, local_scratch_verified_at, production_scratch_verified_at,
    git_verified_at";

struct RawFunctionRow {
    function_name: String,
    match_percent: f64,
    current_score: Option<i64>,
    max_score: Option<i64>,
    status: String,
    build_status: Option<String>,
    build_diagnosis: Option<String>,
    documentation_status: Option<String>,
    local_scratch_slug: Option<String>,
    production_scratch_slug: Option<String>,
    is_committed: bool,
    commit_hash: Option<String>,
    branch: Option<String>,
    worktree_path: Option<String>,
    pr_url: Option<String>,
    pr_number: Option<i64>,
    pr_state: Option<String>,
    claimed_by_agent: Option<String>,
    claimed_at: Option<String>,
    source_file_path: Option<String>,
    canonical_address: Option<String>,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
    local_scratch_verified_at: Option<String>,
    production_scratch_verified_at: Option<String>,
    git_verified_at: Option<String>,
}

fn read_function_row(row: &Row<'_>) -> rusqlite::Result<RawFunctionRow> {
    Ok(RawFunctionRow {
        function_name: row.get(0)?,
        match_percent: row.get(1)?,
        current_score: row.get(2)?,
        max_score: row.get(3)?,
        status: row.get(4)?,
        build_status: row.get(5)?,
        build_diagnosis: row.get(6)?,
        documentation_status: row.get(7)?,
        local_scratch_slug: row.get(8)?,
        production_scratch_slug: row.get(9)?,
        is_committed: row.get(10)?,
        commit_hash: row.get(11)?,
        branch: row.get(12)?,
        worktree_path: row.get(13)?,
        pr_url: row.get(14)?,
        pr_number: row.get(15)?,
        pr_state: row.get(16)?,
        claimed_by_agent: row.get(17)?,
        claimed_at: row.get(18)?,
        source_file_path: row.get(19)?,
        canonical_address: row.get(20)?,
        notes: row.get(21)?,
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
        local_scratch_verified_at: row.get(24)?,
        production_scratch_verified_at: row.get(25)?,
        git_verified_at: row.get(26)?,
    })
}

fn function_from_raw(raw: RawFunctionRow) -> Result<FunctionRecord, StorageError> {
    Ok(FunctionRecord {
        function_name: raw.function_name,
        match_percent: raw.match_percent,
        current_score: raw.current_score,
        max_score: raw.max_score,
        status: raw
            .status
            .parse::<FunctionStatus>()
            .map_err(StorageError::Serialization)?,
        build_status: raw
            .build_status
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(StorageError::Serialization)?,
        build_diagnosis: raw.build_diagnosis,
        documentation_status: raw
            .documentation_status
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(StorageError::Serialization)?,
        local_scratch_slug: raw.local_scratch_slug,
        production_scratch_slug: raw.production_scratch_slug,
        is_committed: raw.is_committed,
        commit_hash: raw.commit_hash,
        branch: raw.branch,
        worktree_path: raw.worktree_path,
        pr_url: raw.pr_url,
        pr_number: raw.pr_number,
        pr_state: raw
            .pr_state
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(StorageError::Serialization)?,
        claimed_by_agent: raw.claimed_by_agent,
        claimed_at: parse_opt_ts(raw.claimed_at)?,
        source_file_path: raw.source_file_path,
        canonical_address: raw.canonical_address,
        notes: raw.notes,
        created_at: parse_ts(&raw.created_at)?,
        updated_at: parse_ts(&raw.updated_at)?,
        local_scratch_verified_at: parse_opt_ts(raw.local_scratch_verified_at)?,
        production_scratch_verified_at: parse_opt_ts(raw.production_scratch_verified_at)?,
        git_verified_at: parse_opt_ts(raw.git_verified_at)?,
    })
}

pub(crate) fn function_by_name(
    conn: &Connection,
    name: &str,
) -> Result<Option<FunctionRecord>, StorageError> {
    let sql = format!("SELECT {FUNCTION_COLUMNS} FROM functions WHERE function_name = ?1");
    let raw = conn
        .query_row(&sql, params![name], |row| read_function_row(row))
        .optional()?;
    raw.map(function_from_raw).transpose()
}

pub(crate) fn function_by_address(
    conn: &Connection,
    canonical: &str,
) -> Result<Option<FunctionRecord>, StorageError> {
    let sql = format!("SELECT {FUNCTION_COLUMNS} FROM functions WHERE canonical_address = ?1");
    let raw = conn
        .query_row(&sql, params![canonical], |row| read_function_row(row))
        .optional()?;
    raw.map(function_from_raw).transpose()
}

/// Columns a patch touches, in declaration order. Absent fields stay absent,
/// which is what keeps them untouched in the upsert.
pub(crate) fn patch_columns(patch: &FunctionPatch) -> Vec<(&'static str, Value)> {
    let mut cols: Vec<(&'static str, Value)> = Vec::new();
    if let Some(v) = patch.match_percent {
        cols.push(("match_percent", Value::Real(v)));
    }
    if let Some(v) = patch.current_score {
        cols.push(("current_score", Value::Integer(v)));
    }
    if let Some(v) = patch.max_score {
        cols.push(("max_score", Value::Integer(v)));
    }
    if let Some(v) = patch.status {
        cols.push(("status", Value::Text(v.as_str().to_string())));
    }
    if let Some(v) = patch.build_status {
        cols.push(("build_status", Value::Text(v.as_str().to_string())));
    }
    if let Some(v) = &patch.build_diagnosis {
        cols.push(("build_diagnosis", Value::Text(v.clone())));
    }
    if let Some(v) = patch.documentation_status {
        cols.push(("documentation_status", Value::Text(v.as_str().to_string())));
    }
    if let Some(v) = &patch.local_scratch_slug {
        cols.push(("local_scratch_slug", Value::Text(v.clone())));
    }
    if let Some(v) = &patch.production_scratch_slug {
        cols.push(("production_scratch_slug", Value::Text(v.clone())));
    }
    if let Some(v) = patch.is_committed {
        cols.push(("is_committed", Value::Integer(i64::from(v))));
    }
    if let Some(v) = &patch.commit_hash {
        cols.push(("commit_hash", Value::Text(v.clone())));
    }
    if let Some(v) = &patch.branch {
        cols.push(("branch", Value::Text(v.clone())));
    }
    if let Some(v) = &patch.worktree_path {
        cols.push(("worktree_path", Value::Text(v.clone())));
    }
    if let Some(v) = &patch.pr_url {
        cols.push(("pr_url", Value::Text(v.clone())));
    }
    if let Some(v) = patch.pr_number {
        cols.push(("pr_number", Value::Integer(v)));
    }
    if let Some(v) = patch.pr_state {
        cols.push(("pr_state", Value::Text(v.as_str().to_string())));
    }
    if let Some(v) = &patch.claimed_by_agent {
        cols.push(("claimed_by_agent", Value::Text(v.clone())));
    }
    if let Some(v) = patch.claimed_at {
        cols.push(("claimed_at", Value::Text(fmt_ts(v))));
    }
    if let Some(v) = &patch.source_file_path {
        cols.push(("source_file_path", Value::Text(v.clone())));
    }
    if let Some(v) = &patch.canonical_address {
        cols.push(("canonical_address", Value::Text(v.clone())));
    }
    if let Some(v) = &patch.notes {
        cols.push(("notes", Value::Text(v.clone())));
    }
    if let Some(v) = patch.local_scratch_verified_at {
        cols.push(("local_scratch_verified_at", Value::Text(fmt_ts(v))));
    }
    if let Some(v) = patch.production_scratch_verified_at {
        cols.push(("production_scratch_verified_at", Value::Text(fmt_ts(v))));
    }
    if let Some(v) = patch.git_verified_at {
        cols.push(("git_verified_at", Value::Text(fmt_ts(v))));
    }
    cols
}

fn scratch_columns(patch: &ScratchPatch) -> Vec<(&'static str, Value)> {
    let mut cols: Vec<(&'static str, Value)> = Vec::new();
    if let Some(v) = &patch.function_name {
        cols.push(("function_name", Value::Text(v.clone())));
    }
    if let Some(v) = &patch.owner_agent {
        cols.push(("owner_agent", Value::Text(v.clone())));
    }
    if let Some(v) = patch.score {
        cols.push(("score", Value::Integer(v)));
    }
    if let Some(v) = patch.max_score {
        cols.push(("max_score", Value::Integer(v)));
    }
    if let Some(v) = patch.match_percent {
        cols.push(("match_percent", Value::Real(v)));
    }
    if let Some(v) = patch.verified_at {
        cols.push(("verified_at", Value::Text(fmt_ts(v))));
    }
    cols
}

impl CoordStore {
    /// Merges a partial update into a function record, creating it when
    /// absent. Exactly one audit row per call: full pre-image as old state,
    /// the patch as new state.
    pub fn upsert_function(
        &mut self,
        function: &str,
        patch: &FunctionPatch,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prior = function_by_name(&tx, function)?;

        let cols = patch_columns(patch);
        let mut names = vec!["function_name"];
        let mut placeholders = vec!["?1".to_string()];
        let mut binds: Vec<Value> = vec![Value::Text(function.to_string())];
        for (index, (column, value)) in cols.iter().enumerate() {
            names.push(column);
            placeholders.push(format!("?{}", index + 2));
            binds.push(value.clone());
        }
        for column in ["created_at", "updated_at"] {
            names.push(column);
            placeholders.push(format!("?{}", binds.len() + 1));
            binds.push(Value::Text(fmt_ts(now)));
        }
        let mut updates: Vec<String> = cols
            .iter()
            .map(|(column, _)| format!("{column} = excluded.{column}"))
            .collect();
        updates.push("updated_at = excluded.updated_at".to_string());

        let sql = format!(
            "INSERT INTO functions ({}) VALUES ({}) ON CONFLICT(function_name) DO UPDATE SET {}",
            names.join(", "),
            placeholders.join(", "),
            updates.join(", "),
        );
        tx.execute(&sql, params_from_iter(binds))?;

        let action = if prior.is_some() {
            AuditAction::Updated
        } else {
            AuditAction::Created
        };
        let mut event = AuditEvent::new(EntityKind::Function, function, action)
            .new_state(ChangeEnvelope::new(EntityChange::Function(patch.clone())));
        if let Some(agent) = agent {
            event = event.agent(agent);
        }
        if let Some(prior) = prior {
            event = event.old(ChangeEnvelope::new(EntityChange::Function(prior.to_patch())));
        }
        append_audit(&tx, event, now)?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_function(&self, function: &str) -> Result<Option<FunctionRecord>, StorageError> {
        function_by_name(&self.conn, function)
    }

    pub fn get_functions_by_status(
        &self,
        status: FunctionStatus,
    ) -> Result<Vec<FunctionRecord>, StorageError> {
        let sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions WHERE status = ?1 ORDER BY updated_at DESC"
        );
        self.query_functions(&sql, params![status.as_str()])
    }

    pub fn get_all_functions(&self) -> Result<Vec<FunctionRecord>, StorageError> {
        let sql = format!("SELECT {FUNCTION_COLUMNS} FROM functions ORDER BY function_name");
        self.query_functions(&sql, [])
    }

    /// Matches that would be lost if not rescued: high match, not committed,
    /// not merged. Best matches first.
    pub fn get_uncommitted_matches(&self) -> Result<Vec<FunctionRecord>, StorageError> {
        let sql = format!(
            "SELECT {FUNCTION_COLUMNS} FROM functions
             WHERE match_percent >= 95.0 AND is_committed = 0 AND status != 'merged'
             ORDER BY match_percent DESC, function_name"
        );
        self.query_functions(&sql, [])
    }

    fn query_functions(
        &self,
        sql: &str,
        binds: impl rusqlite::Params,
    ) -> Result<Vec<FunctionRecord>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(binds, |row| read_function_row(row))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(function_from_raw(row?)?);
        }
        Ok(records)
    }

    /// Entries from the staleness view at least `min_hours` old, stalest
    /// first. The view compares against the wall clock: staleness is an
    /// hours-scale property, not a test-sensitive instant.
    pub fn get_stale_data(&self, min_hours: f64) -> Result<Vec<StaleEntry>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT function_name, stale_type, last_verified, hours_stale
            FROM v_stale_data
            WHERE hours_stale >= ?1
            ORDER BY hours_stale DESC
            ",
        )?;
        let rows = stmt.query_map(params![min_hours], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;
        let mut entries = Vec::new();
        for row in rows {
            let (function_name, stale_type, last_verified, hours_stale) = row?;
            entries.push(StaleEntry {
                function_name,
                stale_type: stale_type
                    .parse::<StaleKind>()
                    .map_err(StorageError::Serialization)?,
                last_verified: parse_opt_ts(last_verified)?,
                hours_stale,
            });
        }
        Ok(entries)
    }

    /// Insert-or-update for a scratch row. Patch fields overwrite when
    /// present and stay untouched when absent.
    pub fn upsert_scratch(
        &mut self,
        slug: &str,
        instance: ScratchInstance,
        base_url: &str,
        patch: &ScratchPatch,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prior = tx
            .query_row(
                "SELECT slug FROM scratches WHERE slug = ?1",
                params![slug],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let cols = scratch_columns(patch);
        let mut names = vec!["slug", "instance", "base_url"];
        let mut placeholders = vec!["?1".to_string(), "?2".to_string(), "?3".to_string()];
        let mut binds: Vec<Value> = vec![
            Value::Text(slug.to_string()),
            Value::Text(instance.as_str().to_string()),
            Value::Text(base_url.to_string()),
        ];
        for (column, value) in &cols {
            names.push(column);
            placeholders.push(format!("?{}", binds.len() + 1));
            binds.push(value.clone());
        }
        names.push("created_at");
        placeholders.push(format!("?{}", binds.len() + 1));
        binds.push(Value::Text(fmt_ts(now)));

        let mut updates = vec![
            "instance = excluded.instance".to_string(),
            "base_url = excluded.base_url".to_string(),
        ];
        updates.extend(
            cols.iter()
                .map(|(column, _)| format!("{column} = excluded.{column}")),
        );

        let sql = format!(
            "INSERT INTO scratches ({}) VALUES ({}) ON CONFLICT(slug) DO UPDATE SET {}",
            names.join(", "),
            placeholders.join(", "),
            updates.join(", "),
        );
        tx.execute(&sql, params_from_iter(binds))?;

        let action = if prior.is_some() {
            AuditAction::Updated
        } else {
            AuditAction::Created
        };
        let mut event = AuditEvent::new(EntityKind::Scratch, slug, action).new_state(
            ChangeEnvelope::new(EntityChange::Scratch(ScratchChange {
                function_name: patch.function_name.clone(),
                instance: Some(instance),
                base_url: Some(base_url.to_string()),
                owner_agent: patch.owner_agent.clone(),
                score: patch.score,
                max_score: patch.max_score,
                match_percent: patch.match_percent,
                last_compiled_at: None,
                verified_at: patch.verified_at,
            })),
        );
        if let Some(agent) = agent {
            event = event.agent(agent);
        }
        append_audit(&tx, event, now)?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_scratch(&self, slug: &str) -> Result<Option<ScratchRecord>, StorageError> {
        let raw = self
            .conn
            .query_row(
                "
                SELECT slug, function_name, instance, base_url, owner_agent, score, max_score,
                       match_percent, created_at, last_compiled_at, verified_at
                FROM scratches WHERE slug = ?1
                ",
                params![slug],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<i64>>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, Option<String>>(9)?,
                        row.get::<_, Option<String>>(10)?,
                    ))
                },
            )
            .optional()?;
        let Some((
            slug,
            function_name,
            instance,
            base_url,
            owner_agent,
            score,
            max_score,
            match_percent,
            created_at,
            last_compiled_at,
            verified_at,
        )) = raw
        else {
            return Ok(None);
        };
        Ok(Some(ScratchRecord {
            slug,
            function_name,
            instance: instance
                .parse::<ScratchInstance>()
                .map_err(StorageError::Serialization)?,
            base_url,
            owner_agent,
            score,
            max_score,
            match_percent,
            created_at: parse_ts(&created_at)?,
            last_compiled_at: parse_opt_ts(last_compiled_at)?,
            verified_at: parse_opt_ts(verified_at)?,
        }))
    }

    /// Appends a score observation for a scratch and refreshes the scratch
    /// row. A repeat of the last observation is skipped entirely; returns
    /// whether anything was recorded.
    ///
    /// Score is a diff score: zero is a perfect match.
    pub fn record_match_score(
        &mut self,
        slug: &str,
        score: i64,
        max_score: i64,
        worktree_path: Option<&str>,
        branch: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let match_percent = if score == 0 {
            100.0
        } else if max_score > 0 {
            (1.0 - score as f64 / max_score as f64) * 100.0
        } else {
            0.0
        };

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let last = tx
            .query_row(
                "SELECT score, max_score FROM match_history
                 WHERE scratch_slug = ?1 ORDER BY recorded_at DESC, id DESC LIMIT 1",
                params![slug],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                    ))
                },
            )
            .optional()?;
        if last == Some((Some(score), Some(max_score))) {
            return Ok(false);
        }

        tx.execute(
            "
            INSERT INTO match_history (
                scratch_slug, score, max_score, match_percent, worktree_path, branch, recorded_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                slug,
                score,
                max_score,
                match_percent,
                worktree_path,
                branch,
                fmt_ts(now)
            ],
        )?;
        tx.execute(
            "
            UPDATE scratches SET score = ?2, max_score = ?3, match_percent = ?4,
                   last_compiled_at = ?5
            WHERE slug = ?1
            ",
            params![slug, score, max_score, match_percent, fmt_ts(now)],
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Refreshes the fleet registry entry for an agent. Absent worktree or
    /// branch leaves the stored value alone.
    pub fn upsert_agent(
        &mut self,
        agent: &str,
        worktree_path: Option<&str>,
        branch_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prior = tx
            .query_row(
                "SELECT agent_id FROM agents WHERE agent_id = ?1",
                params![agent],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        tx.execute(
            "
            INSERT INTO agents (agent_id, worktree_path, branch_name, last_active_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(agent_id) DO UPDATE SET
                worktree_path = COALESCE(excluded.worktree_path, worktree_path),
                branch_name = COALESCE(excluded.branch_name, branch_name),
                last_active_at = excluded.last_active_at
            ",
            params![agent, worktree_path, branch_name, fmt_ts(now)],
        )?;

        let action = if prior.is_some() {
            AuditAction::Updated
        } else {
            AuditAction::Created
        };
        append_audit(
            &tx,
            AuditEvent::new(EntityKind::Agent, agent, action)
                .agent(agent)
                .new_state(ChangeEnvelope::new(EntityChange::Agent(AgentChange {
                    worktree_path: worktree_path.map(str::to_string),
                    branch_name: branch_name.map(str::to_string),
                    last_active_at: Some(now),
                }))),
            now,
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Per-agent claim and commit counts, most recently active first.
    pub fn get_agent_summary(&self) -> Result<Vec<AgentSummary>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT agent_id, worktree_path, branch_name, last_active_at,
                   active_claims, committed_functions
            FROM v_agent_summary
            ORDER BY last_active_at DESC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;
        let mut summaries = Vec::new();
        for row in rows {
            let (agent_id, worktree_path, branch_name, last_active_at, claims, committed) = row?;
            summaries.push(AgentSummary {
                agent_id,
                worktree_path,
                branch_name,
                last_active_at: parse_opt_ts(last_active_at)?,
                active_claims: claims,
                committed_functions: committed,
            });
        }
        Ok(summaries)
    }

    /// Records a local-to-production artifact sync and mirrors the
    /// production slug onto the named function.
    pub fn record_sync(
        &mut self,
        local_slug: &str,
        production_slug: &str,
        function: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "
            INSERT OR REPLACE INTO sync_state (
                local_scratch_slug, production_scratch_slug, function_name, last_synced_at
            ) VALUES (?1, ?2, ?3, ?4)
            ",
            params![local_slug, production_slug, function, fmt_ts(now)],
        )?;
        if let Some(function) = function {
            tx.execute(
                "UPDATE functions SET production_scratch_slug = ?2, updated_at = ?3
                 WHERE function_name = ?1",
                params![function, production_slug, fmt_ts(now)],
            )?;
        }

        append_audit(
            &tx,
            AuditEvent::new(EntityKind::Sync, local_slug, AuditAction::Recorded).new_state(
                ChangeEnvelope::new(EntityChange::Sync(SyncChange {
                    scratch_slug: Some(production_slug.to_string()),
                    synced_at: Some(now),
                    ..Default::default()
                })),
            ),
            now,
        )?;

        tx.commit()?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&mut self, key: &str, value: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prior = tx
            .query_row(
                "SELECT key FROM meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        tx.execute(
            "
            INSERT INTO meta (key, value, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            ",
            params![key, value, fmt_ts(now)],
        )?;

        let action = if prior.is_some() {
            AuditAction::Updated
        } else {
            AuditAction::Created
        };
        append_audit(
            &tx,
            AuditEvent::new(EntityKind::Meta, key, action).new_state(ChangeEnvelope::new(
                EntityChange::Meta(MetaChange {
                    value: Some(value.to_string()),
                }),
            )),
            now,
        )?;

        tx.commit()?;
        Ok(())
    }
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

    #[test]
    fn upsert_creates_then_patches() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .upsert_function(
                "ftCa_Init",
                &FunctionPatch {
                    match_percent: Some(42.0),
                    notes: Some("started".to_string()),
                    ..Default::default()
                },
                Some("agent-1"),
                ts(9, 0),
            )
            .expect("create");
        store
            .upsert_function(
                "ftCa_Init",
                &FunctionPatch {
                    match_percent: Some(97.5),
                    status: Some(FunctionStatus::Matched),
                    ..Default::default()
                },
                Some("agent-1"),
                ts(10, 0),
            )
            .expect("update");

        let record = store
            .get_function("ftCa_Init")
            .expect("get")
            .expect("record");
        assert_eq!(record.match_percent, 97.5);
        assert_eq!(record.status, FunctionStatus::Matched);
        // Fields absent from the second patch are untouched.
        assert_eq!(record.notes.as_deref(), Some("started"));
        assert_eq!(record.created_at, ts(9, 0));
        assert_eq!(record.updated_at, ts(10, 0));
    }

    #[test]
    fn every_upsert_writes_exactly_one_audit_row() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .upsert_function(
                "fn_a",
                &FunctionPatch {
                    match_percent: Some(10.0),
                    ..Default::default()
                },
                Some("agent-1"),
                ts(9, 0),
            )
            .expect("create");
        store
            .upsert_function(
                "fn_a",
                &FunctionPatch {
                    match_percent: Some(20.0),
                    ..Default::default()
                },
                Some("agent-1"),
                ts(9, 5),
            )
            .expect("update");

        let history = store
            .get_history(Some(EntityKind::Function), Some("fn_a"), None, 10)
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, AuditAction::Updated);
        assert_eq!(history[1].action, AuditAction::Created);
        assert!(history[1].old_value.is_none());

        // The update's pre-image carries the full earlier state.
        let old = history[0]
            .old_change()
            .expect("decode")
            .expect("old present");
        match old.change {
            EntityChange::Function(patch) => assert_eq!(patch.match_percent, Some(10.0)),
            other => panic!("expected function change, got {other:?}"),
        }
    }

    #[test]
    fn empty_patches_still_touch_and_audit() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .upsert_function("fn_a", &FunctionPatch::default(), None, ts(9, 0))
            .expect("create");
        let record = store.get_function("fn_a").expect("get").expect("record");
        assert_eq!(record.status, FunctionStatus::Unclaimed);
        assert_eq!(
            store
                .get_history(Some(EntityKind::Function), Some("fn_a"), None, 10)
                .expect("history")
                .len(),
            1
        );
    }

    #[test]
    fn uncommitted_matches_are_the_rescue_list() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        let cases = [
            ("fn_keep", 97.0, false, FunctionStatus::Matched),
            ("fn_low", 94.9, false, FunctionStatus::InProgress),
            ("fn_committed", 100.0, true, FunctionStatus::Committed),
            ("fn_merged", 100.0, false, FunctionStatus::Merged),
        ];
        for (name, percent, committed, status) in cases {
            store
                .upsert_function(
                    name,
                    &FunctionPatch {
                        match_percent: Some(percent),
                        is_committed: Some(committed),
                        status: Some(status),
                        ..Default::default()
                    },
                    None,
                    ts(9, 0),
                )
                .expect("seed");
        }

        let rescue = store.get_uncommitted_matches().expect("query");
        assert_eq!(rescue.len(), 1);
        assert_eq!(rescue[0].function_name, "fn_keep");
    }

    #[test]
    fn status_queries_come_back_newest_first() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        for (name, at) in [("fn_old", ts(9, 0)), ("fn_new", ts(10, 0))] {
            store
                .upsert_function(
                    name,
                    &FunctionPatch {
                        status: Some(FunctionStatus::InProgress),
                        ..Default::default()
                    },
                    None,
                    at,
                )
                .expect("seed");
        }
        let rows = store
            .get_functions_by_status(FunctionStatus::InProgress)
            .expect("query");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].function_name, "fn_new");
    }

    #[test]
    fn scratch_upserts_keep_absent_fields() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .upsert_scratch(
                "abc123",
                ScratchInstance::Local,
                "http://localhost:8000",
                &ScratchPatch {
                    function_name: Some("fn_a".to_string()),
                    owner_agent: Some("agent-1".to_string()),
                    ..Default::default()
                },
                Some("agent-1"),
                ts(9, 0),
            )
            .expect("create");
        store
            .upsert_scratch(
                "abc123",
                ScratchInstance::Local,
                "http://localhost:8000",
                &ScratchPatch {
                    score: Some(120),
                    max_score: Some(1500),
                    ..Default::default()
                },
                Some("agent-1"),
                ts(9, 30),
            )
            .expect("update");

        let scratch = store.get_scratch("abc123").expect("get").expect("row");
        assert_eq!(scratch.owner_agent.as_deref(), Some("agent-1"));
        assert_eq!(scratch.function_name.as_deref(), Some("fn_a"));
        assert_eq!(scratch.score, Some(120));
    }

    #[test]
    fn repeat_scores_are_skipped() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .upsert_scratch(
                "abc123",
                ScratchInstance::Local,
                "http://localhost:8000",
                &ScratchPatch::default(),
                None,
                ts(9, 0),
            )
            .expect("seed scratch");

        assert!(store
            .record_match_score("abc123", 120, 1500, Some("/worktrees/dir-lb"), None, ts(9, 5))
            .expect("first score"));
        assert!(!store
            .record_match_score("abc123", 120, 1500, Some("/worktrees/dir-lb"), None, ts(9, 10))
            .expect("duplicate score"));
        assert!(store
            .record_match_score("abc123", 60, 1500, Some("/worktrees/dir-lb"), None, ts(9, 15))
            .expect("improved score"));

        let count: i64 = store
            .conn
            .query_row(
                "SELECT COUNT(*) FROM match_history WHERE scratch_slug = 'abc123'",
                [],
                |row| row.get(0),
            )
            .expect("count history");
        assert_eq!(count, 2);

        let scratch = store.get_scratch("abc123").expect("get").expect("row");
        assert_eq!(scratch.score, Some(60));
        assert_eq!(scratch.last_compiled_at, Some(ts(9, 15)));
        let expected = (1.0 - 60.0 / 1500.0) * 100.0;
        assert!((scratch.match_percent.expect("percent") - expected).abs() < 1e-9);
    }

    #[test]
    fn perfect_scores_are_a_full_match() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .upsert_scratch(
                "abc123",
                ScratchInstance::Local,
                "http://localhost:8000",
                &ScratchPatch::default(),
                None,
                ts(9, 0),
            )
            .expect("seed scratch");
        store
            .record_match_score("abc123", 0, 1500, None, None, ts(9, 5))
            .expect("perfect score");
        let scratch = store.get_scratch("abc123").expect("get").expect("row");
        assert_eq!(scratch.match_percent, Some(100.0));
    }

    #[test]
    fn agent_registry_coalesces_and_summarizes() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .upsert_agent("agent-1", Some("/worktrees/dir-lb"), Some("agent/lb"), ts(9, 0))
            .expect("register");
        // Activity refresh without worktree info keeps the stored values.
        store
            .upsert_agent("agent-1", None, None, ts(10, 0))
            .expect("refresh");

        // A live claim, relative to the wall clock the summary view uses.
        let now = Utc::now();
        store
            .add_claim("fn_live", "agent-1", None, 3600, now)
            .expect("claim");
        store
            .upsert_function(
                "fn_done",
                &FunctionPatch {
                    is_committed: Some(true),
                    claimed_by_agent: Some("agent-1".to_string()),
                    ..Default::default()
                },
                Some("agent-1"),
                ts(10, 30),
            )
            .expect("commit record");

        let summary = store.get_agent_summary().expect("summary");
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].agent_id, "agent-1");
        assert_eq!(summary[0].worktree_path.as_deref(), Some("/worktrees/dir-lb"));
        assert_eq!(summary[0].last_active_at, Some(ts(10, 0)));
        assert_eq!(summary[0].active_claims, 1);
        assert_eq!(summary[0].committed_functions, 1);
    }

    #[test]
    fn sync_records_mirror_the_production_slug() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .upsert_function("fn_a", &FunctionPatch::default(), None, ts(9, 0))
            .expect("seed function");
        store
            .record_sync("local123", "prod456", Some("fn_a"), ts(9, 30))
            .expect("record sync");

        let record = store.get_function("fn_a").expect("get").expect("record");
        assert_eq!(record.production_scratch_slug.as_deref(), Some("prod456"));

        // Re-sync replaces the pair rather than accumulating rows.
        store
            .record_sync("local123", "prod456", Some("fn_a"), ts(10, 0))
            .expect("repeat sync");
        let count: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM sync_state", [], |row| row.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }

    #[test]
    fn meta_is_a_plain_kv() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        assert_eq!(store.get_meta("report_cursor").expect("get"), None);
        store
            .set_meta("report_cursor", "build-418", ts(9, 0))
            .expect("set");
        store
            .set_meta("report_cursor", "build-419", ts(9, 30))
            .expect("overwrite");
        assert_eq!(
            store.get_meta("report_cursor").expect("get").as_deref(),
            Some("build-419")
        );
    }

    #[test]
    fn stale_probe_reports_old_verifications() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .conn
            .execute(
                "
                INSERT INTO functions (function_name, local_scratch_slug, local_scratch_verified_at)
                VALUES ('fn_stale', 'slug1', '2020-01-01T00:00:00.000Z')
                ",
                [],
            )
            .expect("seed stale");
        let fresh = fmt_ts(Utc::now());
        store
            .conn
            .execute(
                "
                INSERT INTO functions (function_name, local_scratch_slug, local_scratch_verified_at)
                VALUES ('fn_fresh', 'slug2', ?1)
                ",
                params![fresh],
            )
            .expect("seed fresh");

        let stale = store.get_stale_data(1.0).expect("stale probe");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].function_name, "fn_stale");
        assert_eq!(stale[0].stale_type, StaleKind::LocalScratch);
        assert!(stale[0].hours_stale > 24.0);
    }
}
