use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use dfc_core::audit::{AuditAction, ChangeEnvelope, EntityChange, EntityKind, LockChange};
use dfc_core::workspace::{key_path_fragment, worktree_dir_name};
use dfc_core::{LockOutcome, SubdirectoryLock, UnlockOutcome};

use crate::audit::{append_audit, AuditEvent};
use crate::{fmt_ts, parse_opt_ts, parse_ts, CoordStore, StorageError};

/// One broken function in fleet-wide health output, keyed by the worktree it
/// would break.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokenBuild {
    pub worktree_path: Option<String>,
    pub function_name: String,
    pub build_diagnosis: Option<String>,
}

/// Broken functions routed to a workspace key: source paths under the key's
/// directory, or worktrees named for the key.
pub(crate) fn broken_functions_for_key(
    conn: &Connection,
    key: &str,
) -> Result<Vec<String>, rusqlite::Error> {
    let fragment = key_path_fragment(key);
    let dir_name = worktree_dir_name(key);
    let mut stmt = conn.prepare(
        "
        SELECT function_name FROM functions
        WHERE build_status = 'broken'
          AND (
              source_file_path LIKE '%/' || ?1 || '/%'
           OR source_file_path LIKE ?1 || '/%'
           OR worktree_path LIKE '%' || ?2 || '%'
          )
        ORDER BY updated_at DESC
        ",
    )?;
    let rows = stmt.query_map(params![fragment, dir_name], |row| row.get(0))?;
    rows.collect()
}

fn record_assignment(
    conn: &Connection,
    agent: &str,
    key: &str,
    now: DateTime<Utc>,
) -> Result<bool, rusqlite::Error> {
    let changes = conn.execute(
        "
        INSERT OR IGNORE INTO agent_workspaces (agent_id, subdirectory_key, assigned_at)
        VALUES (?1, ?2, ?3)
        ",
        params![agent, key, fmt_ts(now)],
    )?;
    Ok(changes > 0)
}

type RawLockRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    Option<String>,
    String,
);

const LOCK_COLUMNS: &str = "subdirectory_key, worktree_path, branch_name, locked_by_agent,
                            locked_at, lock_expires_at, pending_commits, last_commit_at, updated_at";

fn lock_from_row(raw: RawLockRow) -> Result<SubdirectoryLock, StorageError> {
    let (key, worktree, branch, holder, locked_at, expires, pending, last_commit, updated) = raw;
    Ok(SubdirectoryLock {
        subdirectory_key: key,
        worktree_path: worktree,
        branch_name: branch,
        locked_by_agent: holder,
        locked_at: parse_opt_ts(locked_at)?,
        lock_expires_at: parse_opt_ts(expires)?,
        pending_commits: pending,
        last_commit_at: parse_opt_ts(last_commit)?,
        updated_at: parse_ts(&updated)?,
    })
}

impl CoordStore {
    /// Locks a workspace for an agent. A re-lock by the current holder is an
    /// extension, not a conflict.
    pub fn lock_subdirectory(
        &mut self,
        key: &str,
        agent: &str,
        ttl_mins: i64,
        now: DateTime<Utc>,
    ) -> Result<LockOutcome, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT locked_by_agent, lock_expires_at FROM subdirectory_locks
                 WHERE subdirectory_key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                    ))
                },
            )
            .optional()?;

        let expires_at = now + Duration::minutes(ttl_mins);
        if let Some((Some(holder), Some(raw_expires))) = existing {
            let held_until = parse_ts(&raw_expires)?;
            if held_until > now {
                if holder != agent {
                    return Ok(LockOutcome::HeldByOther {
                        holder,
                        expires_at: held_until,
                    });
                }
                tx.execute(
                    "UPDATE subdirectory_locks SET lock_expires_at = ?2, updated_at = ?3
                     WHERE subdirectory_key = ?1",
                    params![key, fmt_ts(expires_at), fmt_ts(now)],
                )?;
                append_audit(
                    &tx,
                    AuditEvent::new(EntityKind::SubdirectoryLock, key, AuditAction::Extended)
                        .agent(agent)
                        .old(ChangeEnvelope::new(EntityChange::SubdirectoryLock(
                            LockChange {
                                holder: Some(holder.clone()),
                                expires_at: Some(held_until),
                                ..Default::default()
                            },
                        )))
                        .new_state(ChangeEnvelope::new(EntityChange::SubdirectoryLock(
                            LockChange {
                                holder: Some(holder),
                                expires_at: Some(expires_at),
                                ..Default::default()
                            },
                        ))),
                    now,
                )?;
                tx.commit()?;
                return Ok(LockOutcome::Extended { expires_at });
            }
        }

        tx.execute(
            "
            INSERT INTO subdirectory_locks (
                subdirectory_key,
                worktree_path,
                branch_name,
                locked_by_agent,
                locked_at,
                lock_expires_at,
                updated_at
            ) VALUES (?1, '', '', ?2, ?3, ?4, ?3)
            ON CONFLICT(subdirectory_key) DO UPDATE SET
                locked_by_agent = excluded.locked_by_agent,
                locked_at = excluded.locked_at,
                lock_expires_at = excluded.lock_expires_at,
                updated_at = excluded.updated_at
            ",
            params![key, agent, fmt_ts(now), fmt_ts(expires_at)],
        )?;
        record_assignment(&tx, agent, key, now)?;
        append_audit(
            &tx,
            AuditEvent::new(EntityKind::SubdirectoryLock, key, AuditAction::Locked)
                .agent(agent)
                .new_state(ChangeEnvelope::new(EntityChange::SubdirectoryLock(
                    LockChange {
                        holder: Some(agent.to_string()),
                        locked_at: Some(now),
                        expires_at: Some(expires_at),
                        ..Default::default()
                    },
                ))),
            now,
        )?;

        tx.commit()?;
        Ok(LockOutcome::Acquired { expires_at })
    }

    /// Unlocks a workspace. `agent = None` is the administrative override
    /// that ignores ownership. The row survives so counters and history do.
    pub fn unlock_subdirectory(
        &mut self,
        key: &str,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UnlockOutcome, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT locked_by_agent, locked_at, lock_expires_at FROM subdirectory_locks
                 WHERE subdirectory_key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let prior = match &existing {
            Some((Some(holder), locked_at, expires)) => {
                if let Some(required) = agent {
                    if holder != required {
                        return Ok(UnlockOutcome::NotOwner {
                            holder: holder.clone(),
                        });
                    }
                }
                Some(LockChange {
                    holder: Some(holder.clone()),
                    locked_at: parse_opt_ts(locked_at.clone())?,
                    expires_at: parse_opt_ts(expires.clone())?,
                    ..Default::default()
                })
            }
            _ => None,
        };

        tx.execute(
            "
            UPDATE subdirectory_locks SET
                locked_by_agent = NULL,
                locked_at = NULL,
                lock_expires_at = NULL,
                updated_at = ?2
            WHERE subdirectory_key = ?1
            ",
            params![key, fmt_ts(now)],
        )?;

        let mut event = AuditEvent::new(EntityKind::SubdirectoryLock, key, AuditAction::Unlocked);
        if let Some(agent) = agent {
            event = event.agent(agent);
        }
        if let Some(prior) = prior {
            event = event.old(ChangeEnvelope::new(EntityChange::SubdirectoryLock(prior)));
        }
        append_audit(&tx, event, now)?;

        tx.commit()?;
        Ok(UnlockOutcome::Unlocked)
    }

    /// Current lock row, if the key has ever been locked or registered.
    /// Holder liveness is evaluated by the caller via `holder(now)`.
    pub fn get_subdirectory_lock(
        &self,
        key: &str,
    ) -> Result<Option<SubdirectoryLock>, StorageError> {
        let sql = format!(
            "SELECT {LOCK_COLUMNS} FROM subdirectory_locks WHERE subdirectory_key = ?1"
        );
        let raw = self
            .conn
            .query_row(&sql, params![key], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                    row.get(7)?,
                    row.get(8)?,
                ))
            })
            .optional()?;
        raw.map(lock_from_row).transpose()
    }

    /// Every lock row, for status reporting.
    pub fn get_subdirectory_status(&self) -> Result<Vec<SubdirectoryLock>, StorageError> {
        let sql =
            format!("SELECT {LOCK_COLUMNS} FROM subdirectory_locks ORDER BY subdirectory_key");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ))
        })?;
        let mut locks = Vec::new();
        for row in rows {
            locks.push(lock_from_row(row?)?);
        }
        Ok(locks)
    }

    /// Registers the workspace's worktree and branch once the external
    /// worktree machinery has materialized them.
    pub fn upsert_subdirectory(
        &mut self,
        key: &str,
        worktree_path: &str,
        branch_name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prior = tx
            .query_row(
                "SELECT worktree_path, branch_name FROM subdirectory_locks
                 WHERE subdirectory_key = ?1",
                params![key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        tx.execute(
            "
            INSERT INTO subdirectory_locks (subdirectory_key, worktree_path, branch_name, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(subdirectory_key) DO UPDATE SET
                worktree_path = excluded.worktree_path,
                branch_name = excluded.branch_name,
                updated_at = excluded.updated_at
            ",
            params![key, worktree_path, branch_name, fmt_ts(now)],
        )?;

        let action = if prior.is_some() {
            AuditAction::Updated
        } else {
            AuditAction::Created
        };
        let mut event = AuditEvent::new(EntityKind::SubdirectoryLock, key, action).new_state(
            ChangeEnvelope::new(EntityChange::SubdirectoryLock(LockChange {
                worktree_path: Some(worktree_path.to_string()),
                branch_name: Some(branch_name.to_string()),
                ..Default::default()
            })),
        );
        if let Some((old_worktree, old_branch)) = prior {
            event = event.old(ChangeEnvelope::new(EntityChange::SubdirectoryLock(
                LockChange {
                    worktree_path: Some(old_worktree),
                    branch_name: Some(old_branch),
                    ..Default::default()
                },
            )));
        }
        append_audit(&tx, event, now)?;

        tx.commit()?;
        Ok(())
    }

    /// Bumps the pending-commit counter after the external commit cycle
    /// lands one. Returns the new count, or `None` for an unknown key.
    pub fn increment_pending_commits(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT pending_commits FROM subdirectory_locks WHERE subdirectory_key = ?1",
                params![key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };

        let next = current + 1;
        tx.execute(
            "UPDATE subdirectory_locks SET pending_commits = ?2, last_commit_at = ?3, updated_at = ?3
             WHERE subdirectory_key = ?1",
            params![key, next, fmt_ts(now)],
        )?;
        append_audit(
            &tx,
            AuditEvent::new(EntityKind::SubdirectoryLock, key, AuditAction::Updated).new_state(
                ChangeEnvelope::new(EntityChange::SubdirectoryLock(LockChange {
                    pending_commits: Some(next),
                    last_commit_at: Some(now),
                    ..Default::default()
                })),
            ),
            now,
        )?;

        tx.commit()?;
        Ok(Some(next))
    }

    /// Zeroes the pending-commit counter after a collect pass. Returns
    /// whether the key existed.
    pub fn reset_pending_commits(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT pending_commits FROM subdirectory_locks WHERE subdirectory_key = ?1",
                params![key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(false);
        };

        tx.execute(
            "UPDATE subdirectory_locks SET pending_commits = 0, updated_at = ?2
             WHERE subdirectory_key = ?1",
            params![key, fmt_ts(now)],
        )?;
        append_audit(
            &tx,
            AuditEvent::new(EntityKind::SubdirectoryLock, key, AuditAction::Updated)
                .old(ChangeEnvelope::new(EntityChange::SubdirectoryLock(
                    LockChange {
                        pending_commits: Some(current),
                        ..Default::default()
                    },
                )))
                .new_state(ChangeEnvelope::new(EntityChange::SubdirectoryLock(
                    LockChange {
                        pending_commits: Some(0),
                        ..Default::default()
                    },
                ))),
            now,
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Remembers that an agent worked in a workspace. Insert-if-absent;
    /// returns whether a new assignment was recorded.
    pub fn record_agent_workspace(
        &mut self,
        agent: &str,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = record_assignment(&tx, agent, key, now)?;
        if inserted {
            append_audit(
                &tx,
                AuditEvent::new(EntityKind::SubdirectoryLock, key, AuditAction::Recorded)
                    .agent(agent),
                now,
            )?;
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// The backpressure probe: broken functions routed to a key, newest
    /// first.
    pub fn subdirectory_broken_functions(&self, key: &str) -> Result<Vec<String>, StorageError> {
        Ok(broken_functions_for_key(&self.conn, key)?)
    }

    /// Every broken function fleet-wide, grouped by worktree.
    pub fn all_broken_builds(&self) -> Result<Vec<BrokenBuild>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT worktree_path, function_name, build_diagnosis
            FROM functions
            WHERE build_status = 'broken'
            ORDER BY worktree_path, function_name
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BrokenBuild {
                worktree_path: row.get(0)?,
                function_name: row.get(1)?,
                build_diagnosis: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
