//! Temporary-to-permanent identifier mapping and cascade repair

use rusqlite::{params, Connection, OptionalExtension};

use super::entities;
use crate::error::{Error, Result};
use crate::models::IdMapping;
use crate::schema::EntitySchema;
use crate::util::{is_temporary_id, now_ms};

/// What a cascade repair touched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// The entity row moved from its temporary key to the permanent one
    pub moved_primary_key: bool,
    /// Records whose foreign keys were rewritten
    pub rewritten_references: usize,
}

/// Single source of truth for identifier resolution
pub struct IdMapper<'a> {
    conn: &'a Connection,
    schema: &'a EntitySchema,
}

impl<'a> IdMapper<'a> {
    pub const fn new(conn: &'a Connection, schema: &'a EntitySchema) -> Self {
        Self { conn, schema }
    }

    /// Record that the server assigned `server_id` to `temp_id`
    ///
    /// Returns `false` when the identical mapping already exists. A different
    /// server id for an already mapped temporary id is a `DuplicateMapping`.
    pub fn add_mapping(&self, entity_type: &str, temp_id: &str, server_id: &str) -> Result<bool> {
        add_mapping(self.conn, entity_type, temp_id, server_id)
    }

    pub fn get_server_id(&self, entity_type: &str, temp_id: &str) -> Result<Option<String>> {
        get_server_id(self.conn, entity_type, temp_id)
    }

    pub fn get_temp_id(&self, entity_type: &str, server_id: &str) -> Result<Option<String>> {
        get_temp_id(self.conn, entity_type, server_id)
    }

    /// Permanent id when `id` is a mapped temporary id, otherwise `id` itself
    pub fn resolve_id(&self, entity_type: &str, id: &str) -> Result<String> {
        resolve_id(self.conn, entity_type, id)
    }

    pub fn list_mappings(&self, entity_type: &str) -> Result<Vec<IdMapping>> {
        let mut stmt = self.conn.prepare(
            "SELECT entity_type, temp_id, server_id, created_at, resolved_at
             FROM _id_map WHERE entity_type = ?1 ORDER BY resolved_at, temp_id",
        )?;

        let mappings = stmt
            .query_map(params![entity_type], |row| {
                Ok(IdMapping {
                    entity_type: row.get(0)?,
                    temp_id: row.get(1)?,
                    server_id: row.get(2)?,
                    created_at: row.get(3)?,
                    resolved_at: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(mappings)
    }

    /// Move the entity to its permanent key and rewrite every reference to it
    ///
    /// Runs in one transaction: either every table is repaired or none is.
    pub fn repair_references(
        &self,
        entity_type: &str,
        temp_id: &str,
        server_id: &str,
    ) -> Result<RepairReport> {
        let tx = self.conn.unchecked_transaction()?;
        let report = repair_references(&tx, self.schema, entity_type, temp_id, server_id)?;
        tx.commit()?;
        Ok(report)
    }

    /// Add the mapping and run the cascade as a single unit of work
    pub fn map_and_repair(
        &self,
        entity_type: &str,
        temp_id: &str,
        server_id: &str,
    ) -> Result<RepairReport> {
        self.schema.require(entity_type)?;
        let tx = self.conn.unchecked_transaction()?;
        add_mapping(&tx, entity_type, temp_id, server_id)?;
        let report = repair_references(&tx, self.schema, entity_type, temp_id, server_id)?;
        tx.commit()?;

        tracing::debug!(
            "Mapped {entity_type} {temp_id} -> {server_id} ({} references rewritten)",
            report.rewritten_references
        );
        Ok(report)
    }
}

pub(crate) fn add_mapping(
    conn: &Connection,
    entity_type: &str,
    temp_id: &str,
    server_id: &str,
) -> Result<bool> {
    if !is_temporary_id(temp_id) {
        return Err(Error::InvalidInput(format!(
            "{temp_id} is not a temporary identifier"
        )));
    }

    if let Some(existing) = get_server_id(conn, entity_type, temp_id)? {
        if existing == server_id {
            return Ok(false);
        }
        return Err(Error::DuplicateMapping {
            entity_type: entity_type.to_string(),
            temp_id: temp_id.to_string(),
            existing,
            attempted: server_id.to_string(),
        });
    }

    let now = now_ms();
    conn.execute(
        "INSERT INTO _id_map (entity_type, temp_id, server_id, created_at, resolved_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![entity_type, temp_id, server_id, now],
    )?;
    Ok(true)
}

pub(crate) fn get_server_id(
    conn: &Connection,
    entity_type: &str,
    temp_id: &str,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT server_id FROM _id_map WHERE entity_type = ?1 AND temp_id = ?2",
            params![entity_type, temp_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Lookup by temporary id alone; temporary ids are globally unique
pub(crate) fn get_server_id_any(conn: &Connection, temp_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT server_id FROM _id_map WHERE temp_id = ?1 LIMIT 1",
            params![temp_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn get_temp_id(
    conn: &Connection,
    entity_type: &str,
    server_id: &str,
) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT temp_id FROM _id_map WHERE entity_type = ?1 AND server_id = ?2",
            params![entity_type, server_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn resolve_id(conn: &Connection, entity_type: &str, id: &str) -> Result<String> {
    if !is_temporary_id(id) {
        return Ok(id.to_string());
    }
    Ok(get_server_id(conn, entity_type, id)?.unwrap_or_else(|| id.to_string()))
}

/// Every id an entity has been known by: its temporary and permanent forms
pub(crate) fn aliases(conn: &Connection, entity_type: &str, id: &str) -> Result<Vec<String>> {
    let other = if is_temporary_id(id) {
        get_server_id(conn, entity_type, id)?
    } else {
        get_temp_id(conn, entity_type, id)?
    };
    Ok(std::iter::once(id.to_string()).chain(other).collect())
}

pub(crate) fn repair_references(
    conn: &Connection,
    schema: &EntitySchema,
    entity_type: &str,
    temp_id: &str,
    server_id: &str,
) -> Result<RepairReport> {
    schema.require(entity_type)?;
    let mut report = RepairReport::default();

    if let Some(mut record) = entities::get(conn, entity_type, temp_id)? {
        entities::delete(conn, entity_type, temp_id)?;
        if entities::get(conn, entity_type, server_id)?.is_some() {
            tracing::warn!(
                "{entity_type} {server_id} already present locally; replacing it with the row created as {temp_id}"
            );
        }
        record.id = server_id.to_string();
        entities::upsert(conn, &record)?;
        report.moved_primary_key = true;
    }

    for (referencing_type, field) in schema.referencing(entity_type) {
        for mut record in entities::find_mentioning(conn, referencing_type, temp_id)? {
            if entities::rewrite_reference(&mut record.fields, field, temp_id, server_id) {
                entities::upsert(conn, &record)?;
                report.rewritten_references += 1;
            }
        }
    }

    Ok(report)
}

/// Clear every foreign-key value pointing at a temporary id that will never
/// be mapped; returns the number of rows touched
pub(crate) fn drop_references(
    conn: &Connection,
    schema: &EntitySchema,
    entity_type: &str,
    temp_id: &str,
) -> Result<usize> {
    let mut cleared = 0;
    for (referencing_type, field) in schema.referencing(entity_type) {
        for mut record in entities::find_mentioning(conn, referencing_type, temp_id)? {
            if entities::clear_reference(&mut record.fields, field, temp_id) {
                entities::upsert(conn, &record)?;
                cleared += 1;
            }
        }
    }
    Ok(cleared)
}
