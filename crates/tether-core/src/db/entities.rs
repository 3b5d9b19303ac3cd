//! Row-level access to entity tables
//!
//! Table names come from the validated schema, which is why they can be
//! interpolated into SQL here.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{EntityRecord, ID_FIELD, ORGANIZATION_FIELD};

const COLUMNS: &str =
    "id, organization_id, data, dirty, local_updated_at, server_updated_at, sync_version";

type RawRow = (String, Option<String>, String, bool, i64, Option<i64>, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn into_record(entity_type: &str, raw: RawRow) -> Result<EntityRecord> {
    let (id, organization_id, data, dirty, local_updated_at, server_updated_at, sync_version) = raw;
    Ok(EntityRecord {
        entity_type: entity_type.to_string(),
        id,
        organization_id,
        fields: serde_json::from_str(&data)?,
        dirty,
        local_updated_at,
        server_updated_at,
        sync_version,
    })
}

/// Split a JSON object into business fields, dropping `id`
pub(crate) fn strip_id(mut fields: Map<String, Value>) -> Map<String, Value> {
    fields.remove(ID_FIELD);
    fields
}

/// Organization scope carried by a field map
pub(crate) fn organization_of(fields: &Map<String, Value>) -> Option<String> {
    fields.get(ORGANIZATION_FIELD).and_then(crate::util::value_as_id)
}

pub(crate) fn get(conn: &Connection, entity_type: &str, id: &str) -> Result<Option<EntityRecord>> {
    let raw = conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM \"{entity_type}\" WHERE id = ?1"),
            params![id],
            read_row,
        )
        .optional()?;

    raw.map(|raw| into_record(entity_type, raw)).transpose()
}

pub(crate) fn list(
    conn: &Connection,
    entity_type: &str,
    organization_id: Option<&str>,
) -> Result<Vec<EntityRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM \"{entity_type}\"
         WHERE ?1 IS NULL OR organization_id = ?1
         ORDER BY local_updated_at DESC, id"
    ))?;

    let rows = stmt
        .query_map(params![organization_id], read_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|raw| into_record(entity_type, raw))
        .collect()
}

/// Rows whose serialized data mentions `needle`; callers re-check the fields
pub(crate) fn find_mentioning(
    conn: &Connection,
    entity_type: &str,
    needle: &str,
) -> Result<Vec<EntityRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {COLUMNS} FROM \"{entity_type}\" WHERE instr(data, ?1) > 0"
    ))?;

    let rows = stmt
        .query_map(params![needle], read_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|raw| into_record(entity_type, raw))
        .collect()
}

pub(crate) fn upsert(conn: &Connection, record: &EntityRecord) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO \"{}\" ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            record.entity_type
        ),
        params![
            record.id,
            record.organization_id,
            serde_json::to_string(&record.fields)?,
            record.dirty,
            record.local_updated_at,
            record.server_updated_at,
            record.sync_version,
        ],
    )?;
    Ok(())
}

pub(crate) fn delete(conn: &Connection, entity_type: &str, id: &str) -> Result<bool> {
    let rows = conn.execute(
        &format!("DELETE FROM \"{entity_type}\" WHERE id = ?1"),
        params![id],
    )?;
    Ok(rows > 0)
}

/// Record a server acknowledgement: bump the version and set the dirty flag
pub(crate) fn acknowledge(
    conn: &Connection,
    entity_type: &str,
    id: &str,
    still_dirty: bool,
    server_updated_at: Option<i64>,
) -> Result<()> {
    conn.execute(
        &format!(
            "UPDATE \"{entity_type}\"
             SET dirty = ?1,
                 sync_version = sync_version + 1,
                 server_updated_at = COALESCE(?2, server_updated_at)
             WHERE id = ?3"
        ),
        params![still_dirty, server_updated_at, id],
    )?;
    Ok(())
}

pub(crate) fn set_dirty(conn: &Connection, entity_type: &str, id: &str, dirty: bool) -> Result<()> {
    conn.execute(
        &format!("UPDATE \"{entity_type}\" SET dirty = ?1 WHERE id = ?2"),
        params![dirty, id],
    )?;
    Ok(())
}

/// Replace every occurrence of `from` in a foreign-key field, scalar or array
pub(crate) fn rewrite_reference(
    fields: &mut Map<String, Value>,
    field: &str,
    from: &str,
    to: &str,
) -> bool {
    match fields.get_mut(field) {
        Some(Value::String(value)) if value == from => {
            *value = to.to_string();
            true
        }
        Some(Value::Array(items)) => {
            let mut changed = false;
            for item in items.iter_mut() {
                if item.as_str() == Some(from) {
                    *item = Value::String(to.to_string());
                    changed = true;
                }
            }
            changed
        }
        _ => false,
    }
}

/// Remove `target` from a foreign-key field: a scalar becomes null, array
/// elements are dropped
pub(crate) fn clear_reference(fields: &mut Map<String, Value>, field: &str, target: &str) -> bool {
    match fields.get_mut(field) {
        Some(value) if value.as_str() == Some(target) => {
            *value = Value::Null;
            true
        }
        Some(Value::Array(items)) => {
            let before = items.len();
            items.retain(|item| item.as_str() != Some(target));
            items.len() != before
        }
        _ => false,
    }
}
