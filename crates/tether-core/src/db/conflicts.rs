//! Conflict log and user-driven resolution

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::{entities, outbox};
use crate::error::{Error, Result};
use crate::models::{
    EntityRecord, Operation, OutboxStatus, Resolution, SyncConflict, ID_FIELD, SERVER_UPDATED_FIELD,
};
use crate::util::{now_ms, parse_timestamp_ms};

const COLUMNS: &str = "id, entity_type, entity_id, outbox_seq, local_snapshot, server_snapshot, \
     detected_at, resolved_at, resolution";

/// Conflicts surfaced by the server, kept until a user settles them
pub struct ConflictLog<'a> {
    conn: &'a Connection,
}

impl<'a> ConflictLog<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Most recent conflicts first
    pub fn list(&self, unresolved_only: bool, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {COLUMNS} FROM _conflicts
             WHERE ?1 = 0 OR resolved_at = 0
             ORDER BY detected_at DESC, id DESC
             LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![unresolved_only, limit], read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SyncConflict::try_from).collect()
    }

    pub fn get(&self, id: i64) -> Result<Option<SyncConflict>> {
        get(self.conn, id)
    }

    pub fn unresolved_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM _conflicts WHERE resolved_at = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Settle a conflict
    ///
    /// `KeepLocal` requeues the original entry with a fresh retry budget.
    /// `KeepServer` overwrites the local record with the server snapshot and
    /// drops the entry. `Merge` stores the merged fields and requeues them.
    pub fn resolve(&self, id: i64, resolution: Resolution) -> Result<SyncConflict> {
        let tx = self.conn.unchecked_transaction()?;
        let conflict = get(&tx, id)?.ok_or(Error::ConflictNotFound(id))?;
        if conflict.is_resolved() {
            return Err(Error::InvalidInput(format!(
                "conflict {id} was already resolved ({})",
                conflict.resolution.as_deref().unwrap_or("unknown")
            )));
        }

        match &resolution {
            Resolution::KeepLocal => requeue(&tx, conflict.outbox_seq, None)?,
            Resolution::KeepServer => keep_server(&tx, &conflict)?,
            Resolution::Merge(merged) => merge(&tx, &conflict, merged)?,
        }

        tx.execute(
            "UPDATE _conflicts SET resolved_at = ?1, resolution = ?2 WHERE id = ?3",
            params![now_ms(), resolution.label(), id],
        )?;
        tx.commit()?;

        tracing::info!(
            "Resolved conflict {id} on {} {} ({})",
            conflict.entity_type,
            conflict.entity_id,
            resolution.label()
        );
        get(self.conn, id)?.ok_or(Error::ConflictNotFound(id))
    }
}

type RawRow = (i64, String, String, i64, String, String, i64, i64, Option<String>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
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
}

impl TryFrom<RawRow> for SyncConflict {
    type Error = Error;

    fn try_from(raw: RawRow) -> Result<Self> {
        let (id, entity_type, entity_id, outbox_seq, local, server, detected_at, resolved_at, resolution) =
            raw;
        Ok(Self {
            id,
            entity_type,
            entity_id,
            outbox_seq,
            local_snapshot: serde_json::from_str(&local)?,
            server_snapshot: serde_json::from_str(&server)?,
            detected_at,
            resolved_at,
            resolution,
        })
    }
}

fn get(conn: &Connection, id: i64) -> Result<Option<SyncConflict>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM _conflicts WHERE id = ?1"),
        params![id],
        read_row,
    )
    .optional()?
    .map(SyncConflict::try_from)
    .transpose()
}

pub(crate) fn record(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    outbox_seq: i64,
    local_snapshot: &Value,
    server_snapshot: &Value,
) -> Result<SyncConflict> {
    conn.execute(
        "INSERT INTO _conflicts (
            entity_type, entity_id, outbox_seq, local_snapshot, server_snapshot, detected_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entity_type,
            entity_id,
            outbox_seq,
            serde_json::to_string(local_snapshot)?,
            serde_json::to_string(server_snapshot)?,
            now_ms(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    get(conn, id)?.ok_or(Error::ConflictNotFound(id))
}

/// Mark every open conflict raised by an entry as settled
pub(crate) fn close_for_entry(conn: &Connection, outbox_seq: i64, label: &str) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE _conflicts SET resolved_at = ?1, resolution = ?2
         WHERE outbox_seq = ?3 AND resolved_at = 0",
        params![now_ms(), label, outbox_seq],
    )?)
}

/// Put a conflicting entry back in the queue, optionally with a new payload
fn requeue(conn: &Connection, seq: i64, payload: Option<&Value>) -> Result<()> {
    let entry = outbox::require(conn, seq)?;
    if entry.status != OutboxStatus::Conflict {
        return Err(Error::InvalidTransition {
            from: entry.status,
            to: OutboxStatus::Pending,
        });
    }
    outbox::set_status(conn, &entry, OutboxStatus::Pending)?;
    conn.execute(
        "UPDATE _outbox SET retry_count = 0, last_error = NULL WHERE seq = ?1",
        params![seq],
    )?;
    if let Some(payload) = payload {
        conn.execute(
            "UPDATE _outbox SET payload = ?1 WHERE seq = ?2",
            params![serde_json::to_string(payload)?, seq],
        )?;
    }
    Ok(())
}

fn keep_server(conn: &Connection, conflict: &SyncConflict) -> Result<()> {
    let Value::Object(snapshot) = &conflict.server_snapshot else {
        return Err(Error::InvalidInput(format!(
            "server snapshot for conflict {} is not an object",
            conflict.id
        )));
    };

    let existing = entities::get(conn, &conflict.entity_type, &conflict.entity_id)?;
    let record = EntityRecord {
        entity_type: conflict.entity_type.clone(),
        id: conflict.entity_id.clone(),
        organization_id: entities::organization_of(snapshot)
            .or_else(|| existing.as_ref().and_then(|r| r.organization_id.clone())),
        fields: entities::strip_id(snapshot.clone()),
        dirty: false,
        local_updated_at: now_ms(),
        server_updated_at: snapshot.get(SERVER_UPDATED_FIELD).and_then(parse_timestamp_ms),
        sync_version: existing.map_or(1, |r| r.sync_version + 1),
    };
    entities::upsert(conn, &record)?;

    // The entry may already be gone if the user discarded it
    if let Some(entry) = outbox::get(conn, conflict.outbox_seq)? {
        outbox::discard_entry(conn, &entry)?;
    }
    Ok(())
}

fn merge(conn: &Connection, conflict: &SyncConflict, merged: &Map<String, Value>) -> Result<()> {
    let entry = outbox::require(conn, conflict.outbox_seq)?;
    if entry.operation == Operation::Delete {
        return Err(Error::InvalidInput(
            "a delete cannot be resolved by merging".to_string(),
        ));
    }

    let merged = entities::strip_id(merged.clone());
    let mut record = entities::get(conn, &conflict.entity_type, &conflict.entity_id)?
        .ok_or_else(|| Error::not_found(&conflict.entity_type, &conflict.entity_id))?;
    record.fields.extend(merged.clone());
    if let Some(organization_id) = entities::organization_of(&merged) {
        record.organization_id = Some(organization_id);
    }
    record.dirty = true;
    record.local_updated_at = now_ms();
    entities::upsert(conn, &record)?;

    let mut payload = merged;
    if entry.operation == Operation::Create {
        payload.insert(ID_FIELD.to_string(), Value::String(entry.entity_id.clone()));
    }
    requeue(conn, entry.seq, Some(&Value::Object(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::db::{Database, EntityRepository};
    use crate::schema::tests::youth_schema;
    use crate::tests::fields;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    /// A synced group with a pending rename that the server rejected
    fn conflicted(db: &Database) -> (String, SyncConflict) {
        let repo = db.repository();
        let outbox = db.outbox();
        repo.bulk_upsert(
            "groups",
            &[json!({ "id": "100", "name": "Troop", "organization_id": "org1" })],
        )
        .unwrap();
        repo.update("groups", "100", fields(json!({ "name": "Troop 7" })))
            .unwrap();

        let entry = &outbox.get_pending_ordered().unwrap()[0];
        outbox.mark_in_progress(entry.seq).unwrap();
        let conflict = outbox
            .mark_conflict(
                entry.seq,
                json!({ "id": "100", "name": "Troop Seven", "organization_id": "org1", "updated_at": 1_700_000_000_000_i64 }),
            )
            .unwrap();
        ("100".to_string(), conflict)
    }

    fn setup() -> Database {
        Database::open_in_memory(youth_schema(), SyncConfig::default()).unwrap()
    }

    #[test]
    fn test_list_and_count() {
        let db = setup();
        let (_, conflict) = conflicted(&db);
        let log = db.conflicts();

        assert_eq!(log.unresolved_count().unwrap(), 1);
        let listed = log.list(true, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], conflict);
        assert_eq!(log.get(conflict.id).unwrap(), Some(conflict));
        assert_eq!(log.get(999).unwrap(), None);
    }

    #[test]
    fn test_keep_local_requeues_entry() {
        let db = setup();
        let (_, conflict) = conflicted(&db);

        let resolved = db.conflicts().resolve(conflict.id, Resolution::KeepLocal).unwrap();

        assert!(resolved.is_resolved());
        assert_eq!(resolved.resolution.as_deref(), Some("keep_local"));
        let entry = db.outbox().get(conflict.outbox_seq).unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(db.conflicts().unresolved_count().unwrap(), 0);
    }

    #[test]
    fn test_keep_server_overwrites_local() {
        let db = setup();
        let (id, conflict) = conflicted(&db);

        db.conflicts().resolve(conflict.id, Resolution::KeepServer).unwrap();

        let group = db.repository().get("groups", &id).unwrap().unwrap();
        assert_eq!(group.field("name"), Some(&json!("Troop Seven")));
        assert!(!group.dirty);
        assert_eq!(group.server_updated_at, Some(1_700_000_000_000));
        assert!(db.outbox().get(conflict.outbox_seq).unwrap().is_none());
    }

    #[test]
    fn test_merge_requeues_merged_payload() {
        let db = setup();
        let (id, conflict) = conflicted(&db);

        db.conflicts()
            .resolve(
                conflict.id,
                Resolution::Merge(fields(json!({ "name": "Troop 7 (Seven)" }))),
            )
            .unwrap();

        let group = db.repository().get("groups", &id).unwrap().unwrap();
        assert_eq!(group.field("name"), Some(&json!("Troop 7 (Seven)")));
        assert!(group.dirty);

        let entry = db.outbox().get(conflict.outbox_seq).unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.payload, json!({ "name": "Troop 7 (Seven)" }));
    }

    #[test]
    fn test_resolve_twice_is_rejected() {
        let db = setup();
        let (_, conflict) = conflicted(&db);
        let log = db.conflicts();

        log.resolve(conflict.id, Resolution::KeepLocal).unwrap();
        assert!(log.resolve(conflict.id, Resolution::KeepServer).is_err());
        assert!(matches!(
            log.resolve(42, Resolution::KeepLocal),
            Err(Error::ConflictNotFound(42))
        ));
    }

    #[test]
    fn test_list_includes_resolved_on_request() {
        let db = setup();
        let (_, conflict) = conflicted(&db);
        db.conflicts().resolve(conflict.id, Resolution::KeepLocal).unwrap();

        assert!(db.conflicts().list(true, 10).unwrap().is_empty());
        assert_eq!(db.conflicts().list(false, 10).unwrap().len(), 1);
    }
}
