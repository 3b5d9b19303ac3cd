//! Entity repository: the write path that pairs every local mutation with an
//! outbox entry

use std::collections::HashSet;

use rusqlite::Connection;
use serde_json::{Map, Value};

use super::outbox::{self, NewEntry};
use super::{entities, id_mapper};
use crate::error::{Error, Result};
use crate::models::{
    Dependency, EntityRecord, Operation, ID_FIELD, ORGANIZATION_FIELD, SERVER_UPDATED_FIELD,
};
use crate::schema::EntitySchema;
use crate::util::{is_temporary_id, new_temp_id, now_ms, parse_timestamp_ms, value_as_id};

/// Trait for entity storage operations
pub trait EntityRepository {
    /// Create an entity under a fresh temporary id and queue its create
    fn create(&self, entity_type: &str, fields: Map<String, Value>) -> Result<EntityRecord>;

    /// Get an entity by id (temporary ids of synced entities still resolve)
    fn get(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>>;

    /// List entities, optionally scoped to one organization
    fn list(&self, entity_type: &str, organization_id: Option<&str>) -> Result<Vec<EntityRecord>>;

    /// Merge `patch` into an entity and queue the patch
    fn update(&self, entity_type: &str, id: &str, patch: Map<String, Value>)
        -> Result<EntityRecord>;

    /// Delete an entity, queueing a delete only if the server knows it
    fn remove(&self, entity_type: &str, id: &str) -> Result<()>;

    /// Write server records without queueing anything, skipping dirty rows
    fn bulk_upsert(&self, entity_type: &str, server_records: &[Value]) -> Result<UpsertReport>;

    /// Full refresh of one organization's records
    fn replace_all_for_organization(
        &self,
        entity_type: &str,
        organization_id: &str,
        server_records: &[Value],
    ) -> Result<UpsertReport>;
}

/// Outcome of a server-originated write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub written: Vec<String>,
    /// Records left alone because they carry unsynced local edits
    pub skipped_dirty: Vec<String>,
    /// Clean local records absent from a full refresh
    pub removed: Vec<String>,
}

/// `SQLite` implementation of `EntityRepository`
pub struct SqliteEntityRepository<'a> {
    conn: &'a Connection,
    schema: &'a EntitySchema,
}

impl<'a> SqliteEntityRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection, schema: &'a EntitySchema) -> Self {
        Self { conn, schema }
    }

    /// Resolve already-mapped temporary ids in foreign-key fields and collect
    /// the ones still unmapped as dependencies
    fn link_foreign_keys(
        &self,
        conn: &Connection,
        entity_type: &str,
        fields: &mut Map<String, Value>,
    ) -> Result<Vec<Dependency>> {
        let mut dependencies = Vec::new();

        for fk in self.schema.foreign_keys(entity_type) {
            let Some(value) = fields.get_mut(&fk.field) else {
                continue;
            };
            let ids: Vec<&mut Value> = match value {
                Value::Array(items) => items.iter_mut().collect(),
                other => vec![other],
            };
            for id in ids {
                let Value::String(raw) = id else {
                    continue;
                };
                if !is_temporary_id(raw) {
                    continue;
                }
                match id_mapper::get_server_id(conn, &fk.references, raw)? {
                    Some(server_id) => *raw = server_id,
                    None => push_unique(&mut dependencies, Dependency::new(&fk.references, raw.as_str())),
                }
            }
        }

        Ok(dependencies)
    }

    fn require(&self, conn: &Connection, entity_type: &str, id: &str) -> Result<EntityRecord> {
        let id = id_mapper::resolve_id(conn, entity_type, id)?;
        entities::get(conn, entity_type, &id)?.ok_or_else(|| Error::not_found(entity_type, &id))
    }
}

fn push_unique(dependencies: &mut Vec<Dependency>, dependency: Dependency) {
    if !dependencies.contains(&dependency) {
        dependencies.push(dependency);
    }
}

/// Build the local row for a server record; `None` when a dirty row must be kept
fn server_record(
    conn: &Connection,
    entity_type: &str,
    raw: &Value,
    organization_id: Option<&str>,
) -> Result<(String, Option<EntityRecord>)> {
    let Value::Object(object) = raw else {
        return Err(Error::InvalidInput(format!(
            "{entity_type} server record is not an object"
        )));
    };
    let id = object
        .get(ID_FIELD)
        .and_then(value_as_id)
        .ok_or_else(|| Error::InvalidInput(format!("{entity_type} server record has no id")))?;

    let existing = entities::get(conn, entity_type, &id)?;
    if existing.as_ref().is_some_and(|record| record.dirty) {
        return Ok((id, None));
    }

    let mut fields = entities::strip_id(object.clone());
    if let Some(organization_id) = organization_id {
        fields.insert(
            ORGANIZATION_FIELD.to_string(),
            Value::String(organization_id.to_string()),
        );
    }
    let record = EntityRecord {
        entity_type: entity_type.to_string(),
        id: id.clone(),
        organization_id: entities::organization_of(&fields),
        server_updated_at: fields.get(SERVER_UPDATED_FIELD).and_then(parse_timestamp_ms),
        fields,
        dirty: false,
        local_updated_at: now_ms(),
        sync_version: existing.map_or(1, |record| record.sync_version + 1),
    };
    Ok((id, Some(record)))
}

fn upsert_server_records(
    conn: &Connection,
    entity_type: &str,
    server_records: &[Value],
    organization_id: Option<&str>,
    report: &mut UpsertReport,
) -> Result<()> {
    for raw in server_records {
        match server_record(conn, entity_type, raw, organization_id)? {
            (id, Some(record)) => {
                entities::upsert(conn, &record)?;
                report.written.push(id);
            }
            (id, None) => report.skipped_dirty.push(id),
        }
    }
    Ok(())
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn create(&self, entity_type: &str, fields: Map<String, Value>) -> Result<EntityRecord> {
        self.schema.require(entity_type)?;
        let mut fields = entities::strip_id(fields);

        let tx = self.conn.unchecked_transaction()?;
        let dependencies = self.link_foreign_keys(&tx, entity_type, &mut fields)?;

        let record = EntityRecord {
            entity_type: entity_type.to_string(),
            id: new_temp_id(),
            organization_id: entities::organization_of(&fields),
            fields,
            dirty: true,
            local_updated_at: now_ms(),
            server_updated_at: None,
            sync_version: 0,
        };
        entities::upsert(&tx, &record)?;
        outbox::append(
            &tx,
            &NewEntry {
                entity_type,
                entity_id: &record.id,
                operation: Operation::Create,
                payload: &record.to_payload(),
                dependencies: &dependencies,
            },
        )?;
        tx.commit()?;

        Ok(record)
    }

    fn get(&self, entity_type: &str, id: &str) -> Result<Option<EntityRecord>> {
        self.schema.require(entity_type)?;
        let id = id_mapper::resolve_id(self.conn, entity_type, id)?;
        entities::get(self.conn, entity_type, &id)
    }

    fn list(&self, entity_type: &str, organization_id: Option<&str>) -> Result<Vec<EntityRecord>> {
        self.schema.require(entity_type)?;
        entities::list(self.conn, entity_type, organization_id)
    }

    fn update(
        &self,
        entity_type: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<EntityRecord> {
        self.schema.require(entity_type)?;
        let mut patch = entities::strip_id(patch);

        let tx = self.conn.unchecked_transaction()?;
        let mut record = self.require(&tx, entity_type, id)?;
        let mut dependencies = self.link_foreign_keys(&tx, entity_type, &mut patch)?;
        // An update to an entity the server has not seen waits for its create
        if record.is_temporary() {
            push_unique(
                &mut dependencies,
                Dependency::new(entity_type, record.id.as_str()),
            );
        }

        record.fields.extend(patch.clone());
        if patch.contains_key(ORGANIZATION_FIELD) {
            record.organization_id = entities::organization_of(&record.fields);
        }
        record.dirty = true;
        record.local_updated_at = now_ms();
        entities::upsert(&tx, &record)?;

        outbox::append(
            &tx,
            &NewEntry {
                entity_type,
                entity_id: &record.id,
                operation: Operation::Update,
                payload: &Value::Object(patch),
                dependencies: &dependencies,
            },
        )?;
        tx.commit()?;

        Ok(record)
    }

    fn remove(&self, entity_type: &str, id: &str) -> Result<()> {
        self.schema.require(entity_type)?;

        let tx = self.conn.unchecked_transaction()?;
        let record = self.require(&tx, entity_type, id)?;
        entities::delete(&tx, entity_type, &record.id)?;

        if record.is_temporary() {
            let dropped = outbox::delete_for_entity(&tx, entity_type, &record.id)?;
            outbox::fail_dependents(&tx, entity_type, &record.id, "was removed before it synced")?;
            let cleared = id_mapper::drop_references(&tx, self.schema, entity_type, &record.id)?;
            tracing::debug!(
                "Removed unsynced {entity_type} {}, {dropped} outbox entries and {cleared} references",
                record.id
            );
        } else {
            let mut payload = Map::new();
            payload.insert(ID_FIELD.to_string(), Value::String(record.id.clone()));
            outbox::append(
                &tx,
                &NewEntry {
                    entity_type,
                    entity_id: &record.id,
                    operation: Operation::Delete,
                    payload: &Value::Object(payload),
                    dependencies: &[],
                },
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn bulk_upsert(&self, entity_type: &str, server_records: &[Value]) -> Result<UpsertReport> {
        self.schema.require(entity_type)?;
        let mut report = UpsertReport::default();

        let tx = self.conn.unchecked_transaction()?;
        upsert_server_records(&tx, entity_type, server_records, None, &mut report)?;
        tx.commit()?;

        if !report.skipped_dirty.is_empty() {
            tracing::debug!(
                "Kept {} dirty {entity_type} records over server data",
                report.skipped_dirty.len()
            );
        }
        Ok(report)
    }

    fn replace_all_for_organization(
        &self,
        entity_type: &str,
        organization_id: &str,
        server_records: &[Value],
    ) -> Result<UpsertReport> {
        self.schema.require(entity_type)?;
        let mut report = UpsertReport::default();

        let incoming: HashSet<String> = server_records
            .iter()
            .filter_map(|record| record.get(ID_FIELD).and_then(value_as_id))
            .collect();

        let tx = self.conn.unchecked_transaction()?;
        for local in entities::list(&tx, entity_type, Some(organization_id))? {
            if local.dirty || local.is_temporary() || incoming.contains(&local.id) {
                continue;
            }
            entities::delete(&tx, entity_type, &local.id)?;
            report.removed.push(local.id);
        }
        upsert_server_records(
            &tx,
            entity_type,
            server_records,
            Some(organization_id),
            &mut report,
        )?;
        tx.commit()?;

        tracing::debug!(
            "Refreshed {entity_type} for organization {organization_id}: {} written, {} removed, {} kept dirty",
            report.written.len(),
            report.removed.len(),
            report.skipped_dirty.len()
        );
        Ok(report)
    }
}
