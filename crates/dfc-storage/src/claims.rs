use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use dfc_core::audit::{AuditAction, ChangeEnvelope, ClaimChange, EntityChange, EntityKind};
use dfc_core::workspace::BROKEN_BUILD_CLAIM_THRESHOLD;
use dfc_core::{ActiveClaim, ClaimOutcome, Lease, ReleaseOutcome};

use crate::audit::{append_audit, AuditEvent};
use crate::locks::broken_functions_for_key;
use crate::{fmt_ts, parse_ts, CoordStore, StorageError};

impl CoordStore {
    /// Claims a function for an agent. The whole check-then-act runs in one
    /// immediate transaction, so two racing claimers cannot both see "free"
    /// and both insert.
    ///
    /// When the claim routes into a workspace (`workspace` key given), the
    /// workspace's broken-build count is checked first and the claim is
    /// refused once it reaches the admission threshold.
    pub fn add_claim(
        &mut self,
        function: &str,
        agent: &str,
        workspace: Option<&str>,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(key) = workspace {
            let broken = broken_functions_for_key(&tx, key)?;
            if broken.len() >= BROKEN_BUILD_CLAIM_THRESHOLD {
                return Ok(ClaimOutcome::WorkspaceUnhealthy {
                    workspace: key.to_string(),
                    broken_functions: broken,
                });
            }
        }

        let existing = tx
            .query_row(
                "SELECT agent_id, expires_at FROM claims WHERE function_name = ?1",
                params![function],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        if let Some((holder, raw_expires)) = existing {
            let expires_at = parse_ts(&raw_expires)?;
            if expires_at > now {
                if holder == agent {
                    return Ok(ClaimOutcome::AlreadyYours { expires_at });
                }
                return Ok(ClaimOutcome::HeldByOther { holder, expires_at });
            }
            // Stale lease: purged here, at the moment someone wants the
            // function again.
            tx.execute(
                "DELETE FROM claims WHERE function_name = ?1",
                params![function],
            )?;
        }

        let expires_at = now + Duration::seconds(ttl_secs);
        tx.execute(
            "
            INSERT INTO claims (function_name, agent_id, claimed_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![function, agent, fmt_ts(now), fmt_ts(expires_at)],
        )?;
        tx.execute(
            "
            INSERT INTO functions (
                function_name,
                status,
                claimed_by_agent,
                claimed_at,
                created_at,
                updated_at
            ) VALUES (?1, 'claimed', ?2, ?3, ?4, ?4)
            ON CONFLICT(function_name) DO UPDATE SET
                status = 'claimed',
                claimed_by_agent = excluded.claimed_by_agent,
                claimed_at = excluded.claimed_at,
                updated_at = excluded.updated_at
            ",
            params![function, agent, fmt_ts(now), fmt_ts(now)],
        )?;

        append_audit(
            &tx,
            AuditEvent::new(EntityKind::Claim, function, AuditAction::Created)
                .agent(agent)
                .new_state(ChangeEnvelope::new(EntityChange::Claim(ClaimChange {
                    agent_id: Some(agent.to_string()),
                    claimed_at: Some(now),
                    expires_at: Some(expires_at),
                }))),
            now,
        )?;

        tx.commit()?;
        Ok(ClaimOutcome::Acquired { expires_at })
    }

    /// Releases a lease. With `agent` given the release is ownership-checked;
    /// `None` releases unconditionally. The function's status is demoted to
    /// unclaimed only if it is still `claimed`, so a release never stomps a
    /// concurrent transition to a later status.
    pub fn release_claim(
        &mut self,
        function: &str,
        agent: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, StorageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT agent_id, claimed_at, expires_at FROM claims WHERE function_name = ?1",
                params![function],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((holder, raw_claimed, raw_expires)) = existing else {
            return Ok(ReleaseOutcome::NotClaimed);
        };
        if let Some(agent) = agent {
            if holder != agent {
                return Ok(ReleaseOutcome::NotOwner { holder });
            }
        }

        let claimed_at = parse_ts(&raw_claimed)?;
        let expires_at = parse_ts(&raw_expires)?;
        tx.execute(
            "DELETE FROM claims WHERE function_name = ?1",
            params![function],
        )?;
        tx.execute(
            "
            UPDATE functions SET
                status = 'unclaimed',
                claimed_by_agent = NULL,
                claimed_at = NULL,
                updated_at = ?2
            WHERE function_name = ?1 AND status = 'claimed'
            ",
            params![function, fmt_ts(now)],
        )?;

        append_audit(
            &tx,
            AuditEvent::new(EntityKind::Claim, function, AuditAction::Released)
                .agent(agent.unwrap_or(&holder))
                .old(ChangeEnvelope::new(EntityChange::Claim(ClaimChange {
                    agent_id: Some(holder.clone()),
                    claimed_at: Some(claimed_at),
                    expires_at: Some(expires_at),
                }))),
            now,
        )?;

        tx.commit()?;
        Ok(ReleaseOutcome::Released { holder })
    }

    /// Raw lease row, expired or not. Liveness is the caller's question:
    /// `lease.is_active(now)`.
    pub fn get_claim(&self, function: &str) -> Result<Option<Lease>, StorageError> {
        let row = self
            .conn
            .query_row(
                "SELECT function_name, agent_id, claimed_at, expires_at
                 FROM claims WHERE function_name = ?1",
                params![function],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((function_name, agent_id, claimed_at, expires_at)) = row else {
            return Ok(None);
        };
        Ok(Some(Lease {
            function_name,
            agent_id,
            claimed_at: parse_ts(&claimed_at)?,
            expires_at: parse_ts(&expires_at)?,
        }))
    }

    /// Live leases joined with their function's match state, soonest expiry
    /// first.
    pub fn get_active_claims(&self, now: DateTime<Utc>) -> Result<Vec<ActiveClaim>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT c.function_name, c.agent_id, c.claimed_at, c.expires_at,
                   f.match_percent, f.local_scratch_slug
            FROM claims c
            LEFT JOIN functions f ON f.function_name = c.function_name
            WHERE c.expires_at > ?1
            ORDER BY c.expires_at
            ",
        )?;
        let rows = stmt.query_map(params![fmt_ts(now)], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<String>>(5)?,
            ))
        })?;

        let mut claims = Vec::new();
        for row in rows {
            let (function_name, agent_id, raw_claimed, raw_expires, match_percent, slug) = row?;
            let claimed_at = parse_ts(&raw_claimed)?;
            let expires_at = parse_ts(&raw_expires)?;
            let minutes_remaining = (expires_at - now).num_seconds() as f64 / 60.0;
            claims.push(ActiveClaim {
                function_name,
                agent_id,
                claimed_at,
                expires_at,
                minutes_remaining,
                match_percent,
                local_scratch_slug: slug,
            });
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dfc_core::FunctionStatus;

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn function_status(store: &CoordStore, name: &str) -> Option<(String, Option<String>)> {
        store
            .conn
            .query_row(
                "SELECT status, claimed_by_agent FROM functions WHERE function_name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .expect("query function")
    }

    #[test]
    fn claim_acquires_and_creates_the_function_record() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        let outcome = store
            .add_claim("ftCa_Init", "agent-1", None, 3600, ts(9, 0))
            .expect("claim");
        assert_eq!(
            outcome,
            ClaimOutcome::Acquired {
                expires_at: ts(10, 0)
            }
        );
        let (status, claimed_by) = function_status(&store, "ftCa_Init").expect("record created");
        assert_eq!(status, FunctionStatus::Claimed.as_str());
        assert_eq!(claimed_by.as_deref(), Some("agent-1"));
    }

    #[test]
    fn reclaim_by_the_holder_is_idempotent() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .add_claim("fn_a", "agent-1", None, 3600, ts(9, 0))
            .expect("claim");
        let outcome = store
            .add_claim("fn_a", "agent-1", None, 3600, ts(9, 30))
            .expect("reclaim");
        // Expiry stays where the first claim put it.
        assert_eq!(
            outcome,
            ClaimOutcome::AlreadyYours {
                expires_at: ts(10, 0)
            }
        );
    }

    #[test]
    fn a_live_claim_blocks_other_agents() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .add_claim("fn_a", "agent-1", None, 3600, ts(9, 0))
            .expect("claim");
        let outcome = store
            .add_claim("fn_a", "agent-2", None, 3600, ts(9, 30))
            .expect("claim attempt");
        assert_eq!(
            outcome,
            ClaimOutcome::HeldByOther {
                holder: "agent-1".to_string(),
                expires_at: ts(10, 0)
            }
        );
    }

    #[test]
    fn an_expired_claim_is_reclaimable() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .add_claim("fn_a", "agent-1", None, 3600, ts(9, 0))
            .expect("claim");
        let outcome = store
            .add_claim("fn_a", "agent-2", None, 3600, ts(11, 0))
            .expect("reclaim after expiry");
        assert_eq!(
            outcome,
            ClaimOutcome::Acquired {
                expires_at: ts(12, 0)
            }
        );
        let lease = store.get_claim("fn_a").expect("get claim").expect("lease");
        assert_eq!(lease.agent_id, "agent-2");
    }

    #[test]
    fn release_is_ownership_checked() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .add_claim("fn_a", "agent-1", None, 3600, ts(9, 0))
            .expect("claim");

        let denied = store
            .release_claim("fn_a", Some("agent-2"), ts(9, 10))
            .expect("release attempt");
        assert_eq!(
            denied,
            ReleaseOutcome::NotOwner {
                holder: "agent-1".to_string()
            }
        );

        let released = store
            .release_claim("fn_a", Some("agent-1"), ts(9, 20))
            .expect("release");
        assert_eq!(
            released,
            ReleaseOutcome::Released {
                holder: "agent-1".to_string()
            }
        );
        let (status, claimed_by) = function_status(&store, "fn_a").expect("record");
        assert_eq!(status, FunctionStatus::Unclaimed.as_str());
        assert_eq!(claimed_by, None);

        let again = store
            .release_claim("fn_a", Some("agent-1"), ts(9, 30))
            .expect("second release");
        assert_eq!(again, ReleaseOutcome::NotClaimed);
    }

    #[test]
    fn release_never_stomps_a_later_status() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .add_claim("fn_a", "agent-1", None, 3600, ts(9, 0))
            .expect("claim");
        store
            .conn
            .execute(
                "UPDATE functions SET status = 'matched' WHERE function_name = 'fn_a'",
                [],
            )
            .expect("simulate concurrent transition");

        store
            .release_claim("fn_a", Some("agent-1"), ts(9, 30))
            .expect("release");
        let (status, _) = function_status(&store, "fn_a").expect("record");
        assert_eq!(status, FunctionStatus::Matched.as_str());
    }

    #[test]
    fn active_claims_filter_by_injected_now() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .add_claim("fn_a", "agent-1", None, 3600, ts(9, 0))
            .expect("claim");
        store
            .add_claim("fn_b", "agent-2", None, 7200, ts(9, 0))
            .expect("claim");

        let at_930 = store.get_active_claims(ts(9, 30)).expect("active claims");
        assert_eq!(at_930.len(), 2);
        assert_eq!(at_930[0].function_name, "fn_a");
        assert!((at_930[0].minutes_remaining - 30.0).abs() < f64::EPSILON);

        let at_1030 = store.get_active_claims(ts(10, 30)).expect("active claims");
        assert_eq!(at_1030.len(), 1);
        assert_eq!(at_1030[0].function_name, "fn_b");
    }

    #[test]
    fn claim_and_release_leave_an_audit_trail() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        store
            .add_claim("fn_a", "agent-1", None, 3600, ts(9, 0))
            .expect("claim");
        store
            .release_claim("fn_a", Some("agent-1"), ts(9, 30))
            .expect("release");

        let history = store
            .get_history(Some(EntityKind::Claim), Some("fn_a"), None, 10)
            .expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, AuditAction::Released);
        assert_eq!(history[1].action, AuditAction::Created);
        let envelope = history[1]
            .new_change()
            .expect("decode")
            .expect("new state present");
        assert!(matches!(envelope.change, EntityChange::Claim(_)));
    }

    #[test]
    fn unhealthy_workspaces_refuse_new_claims() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        for name in ["ftCa_Broken1", "ftCa_Broken2", "ftCa_Broken3"] {
            store
                .conn
                .execute(
                    "
                    INSERT INTO functions (function_name, build_status, source_file_path)
                    VALUES (?1, 'broken', 'melee/ft/chara/ftCaptain/' || ?1 || '.c')
                    ",
                    params![name],
                )
                .expect("seed broken function");
        }

        let outcome = store
            .add_claim("ftCa_Init", "agent-1", Some("ft-chara-ftCaptain"), 3600, ts(9, 0))
            .expect("claim attempt");
        match outcome {
            ClaimOutcome::WorkspaceUnhealthy {
                workspace,
                broken_functions,
            } => {
                assert_eq!(workspace, "ft-chara-ftCaptain");
                assert_eq!(broken_functions.len(), 3);
                assert!(broken_functions.contains(&"ftCa_Broken2".to_string()));
            }
            other => panic!("expected workspace refusal, got {other:?}"),
        }
        assert!(store.get_claim("ftCa_Init").expect("get claim").is_none());
    }

    #[test]
    fn claims_are_admitted_below_the_broken_threshold() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        for name in ["ftCa_Broken1", "ftCa_Broken2"] {
            store
                .conn
                .execute(
                    "
                    INSERT INTO functions (function_name, build_status, source_file_path)
                    VALUES (?1, 'broken', 'melee/ft/chara/ftCaptain/' || ?1 || '.c')
                    ",
                    params![name],
                )
                .expect("seed broken function");
        }

        let outcome = store
            .add_claim("ftCa_Init", "agent-1", Some("ft-chara-ftCaptain"), 3600, ts(9, 0))
            .expect("claim");
        assert!(outcome.succeeded());
    }
}
