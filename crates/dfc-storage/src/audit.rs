use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Transaction};

use dfc_core::audit::{AuditAction, AuditEntry, ChangeEnvelope, EntityKind, MetadataEnvelope};

use crate::{fmt_ts, parse_ts, CoordStore, StorageError};

/// One audit row to append, minus the timestamp the caller injects.
pub(crate) struct AuditEvent<'a> {
    pub entity_type: EntityKind,
    pub entity_id: &'a str,
    pub action: AuditAction,
    pub agent_id: Option<&'a str>,
    pub old_value: Option<ChangeEnvelope>,
    pub new_value: Option<ChangeEnvelope>,
    pub metadata: Option<MetadataEnvelope>,
}

impl<'a> AuditEvent<'a> {
    pub fn new(entity_type: EntityKind, entity_id: &'a str, action: AuditAction) -> Self {
        Self {
            entity_type,
            entity_id,
            action,
            agent_id: None,
            old_value: None,
            new_value: None,
            metadata: None,
        }
    }

    pub fn agent(mut self, agent_id: &'a str) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn old(mut self, envelope: ChangeEnvelope) -> Self {
        self.old_value = Some(envelope);
        self
    }

    pub fn new_state(mut self, envelope: ChangeEnvelope) -> Self {
        self.new_value = Some(envelope);
        self
    }

    pub fn metadata(mut self, envelope: MetadataEnvelope) -> Self {
        self.metadata = Some(envelope);
        self
    }
}

/// Appends inside the caller's transaction, so a mutation and its audit row
/// commit or roll back together.
pub(crate) fn append_audit(
    tx: &Transaction<'_>,
    event: AuditEvent<'_>,
    now: DateTime<Utc>,
) -> Result<(), StorageError> {
    let old_json = event
        .old_value
        .as_ref()
        .map(ChangeEnvelope::to_json)
        .transpose()?;
    let new_json = event
        .new_value
        .as_ref()
        .map(ChangeEnvelope::to_json)
        .transpose()?;
    let metadata_json = event
        .metadata
        .as_ref()
        .map(MetadataEnvelope::to_json)
        .transpose()?;

    tx.execute(
        "
        INSERT INTO audit_log (
            entity_type,
            entity_id,
            action,
            agent_id,
            timestamp,
            old_value,
            new_value,
            metadata
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        ",
        params![
            event.entity_type.as_str(),
            event.entity_id,
            event.action.as_str(),
            event.agent_id,
            fmt_ts(now),
            old_json,
            new_json,
            metadata_json,
        ],
    )?;
    Ok(())
}

impl CoordStore {
    /// Newest-first slice of the audit ledger, optionally narrowed by entity
    /// type, entity id, or acting agent.
    pub fn get_history(
        &self,
        entity_type: Option<EntityKind>,
        entity_id: Option<&str>,
        agent: Option<&str>,
        limit: usize,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let mut sql = String::from(
            "SELECT id, entity_type, entity_id, action, agent_id, timestamp,
                    old_value, new_value, metadata
             FROM audit_log",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<Value> = Vec::new();
        if let Some(kind) = entity_type {
            clauses.push("entity_type = ?");
            binds.push(Value::Text(kind.as_str().to_string()));
        }
        if let Some(id) = entity_id {
            clauses.push("entity_id = ?");
            binds.push(Value::Text(id.to_string()));
        }
        if let Some(agent_id) = agent {
            clauses.push("agent_id = ?");
            binds.push(Value::Text(agent_id.to_string()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC LIMIT ?");
        binds.push(Value::Integer(limit as i64));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, entity_type, entity_id, action, agent_id, timestamp, old_value, new_value, metadata) =
                row?;
            entries.push(AuditEntry {
                id,
                entity_type: entity_type
                    .parse::<EntityKind>()
                    .map_err(StorageError::Serialization)?,
                entity_id,
                action: action
                    .parse::<AuditAction>()
                    .map_err(StorageError::Serialization)?,
                agent_id,
                timestamp: parse_ts(&timestamp)?,
                old_value,
                new_value,
                metadata,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use dfc_core::audit::{ClaimChange, EntityChange};

    fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    fn append(store: &mut CoordStore, event: AuditEvent<'_>, now: DateTime<Utc>) {
        let tx = store.conn.transaction().expect("begin");
        append_audit(&tx, event, now).expect("append audit");
        tx.commit().expect("commit");
    }

    #[test]
    fn history_is_newest_first_and_filtered() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        append(
            &mut store,
            AuditEvent::new(EntityKind::Claim, "fn_a", AuditAction::Created).agent("agent-1"),
            ts(9, 0),
        );
        append(
            &mut store,
            AuditEvent::new(EntityKind::Claim, "fn_b", AuditAction::Created).agent("agent-2"),
            ts(9, 5),
        );
        append(
            &mut store,
            AuditEvent::new(EntityKind::Claim, "fn_a", AuditAction::Released).agent("agent-1"),
            ts(9, 10),
        );

        let all = store
            .get_history(Some(EntityKind::Claim), None, None, 50)
            .expect("history");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].action, AuditAction::Released);
        assert_eq!(all[2].entity_id, "fn_a");

        let fn_a = store
            .get_history(Some(EntityKind::Claim), Some("fn_a"), None, 50)
            .expect("history");
        assert_eq!(fn_a.len(), 2);

        let agent_2 = store
            .get_history(None, None, Some("agent-2"), 50)
            .expect("history");
        assert_eq!(agent_2.len(), 1);
        assert_eq!(agent_2[0].entity_id, "fn_b");

        let limited = store.get_history(None, None, None, 1).expect("history");
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].action, AuditAction::Released);
    }

    #[test]
    fn stored_envelopes_decode_back_to_typed_changes() {
        let mut store = CoordStore::open_in_memory().expect("open db");
        let change = EntityChange::Claim(ClaimChange {
            agent_id: Some("agent-1".to_string()),
            claimed_at: Some(ts(9, 0)),
            expires_at: Some(ts(10, 0)),
        });
        append(
            &mut store,
            AuditEvent::new(EntityKind::Claim, "fn_a", AuditAction::Created)
                .agent("agent-1")
                .new_state(ChangeEnvelope::new(change.clone())),
            ts(9, 0),
        );

        let entries = store.get_history(None, None, None, 10).expect("history");
        let envelope = entries[0]
            .new_change()
            .expect("decode envelope")
            .expect("envelope present");
        assert_eq!(envelope.change, change);
        assert!(entries[0].old_change().expect("decode").is_none());
    }
}
