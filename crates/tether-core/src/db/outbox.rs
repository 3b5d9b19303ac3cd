//! Outbox manager: ordering, dependency gating and the status lifecycle

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{conflicts, entities, id_mapper};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{
    Dependency, Operation, OutboxEntry, OutboxStatus, SyncConflict, ID_FIELD, SERVER_UPDATED_FIELD,
};
use crate::schema::EntitySchema;
use crate::util::{is_temporary_id, new_correlation_id, now_ms, parse_timestamp_ms};

const COLUMNS: &str = "seq, correlation_id, entity_type, entity_id, temp_id, operation, payload, \
     dependencies, status, retry_count, last_error, server_response, created_at, updated_at";

/// Entry about to be appended by the repository
pub(crate) struct NewEntry<'e> {
    pub entity_type: &'e str,
    pub entity_id: &'e str,
    pub operation: Operation,
    pub payload: &'e Value,
    pub dependencies: &'e [Dependency],
}

/// Decides what to send, in which order, and tracks each entry's lifecycle
pub struct OutboxManager<'a> {
    conn: &'a Connection,
    schema: &'a EntitySchema,
    config: &'a SyncConfig,
}

impl<'a> OutboxManager<'a> {
    pub const fn new(conn: &'a Connection, schema: &'a EntitySchema, config: &'a SyncConfig) -> Self {
        Self {
            conn,
            schema,
            config,
        }
    }

    pub fn get(&self, seq: i64) -> Result<Option<OutboxEntry>> {
        get(self.conn, seq)
    }

    pub fn list_by_status(&self, status: OutboxStatus) -> Result<Vec<OutboxEntry>> {
        query_entries(
            self.conn,
            &format!("SELECT {COLUMNS} FROM _outbox WHERE status = ?1 ORDER BY created_at, seq"),
            params![status.as_str()],
        )
    }

    /// Pending entries in dispatch order
    ///
    /// Sorted by the schema's entity priority, then by the original mutation
    /// time, then by sequence. Entity types missing from the priority list
    /// come last.
    pub fn get_pending_ordered(&self) -> Result<Vec<OutboxEntry>> {
        let mut entries = self.list_by_status(OutboxStatus::Pending)?;
        entries.sort_by_key(|entry| {
            (
                self.schema.priority_of(&entry.entity_type),
                entry.created_at,
                entry.seq,
            )
        });
        Ok(entries)
    }

    /// Backlog size, the health indicator surfaced to users
    pub fn pending_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM _outbox WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Number of entries per status, in lifecycle order
    pub fn status_counts(&self) -> Result<Vec<(OutboxStatus, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM _outbox GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts: Vec<(OutboxStatus, usize)> =
            OutboxStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for (status, count) in rows {
            let status: OutboxStatus = status.parse()?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = usize::try_from(count).unwrap_or_default();
            }
        }
        Ok(counts)
    }

    /// Whether every temporary id the entry depends on has been mapped
    pub fn are_dependencies_satisfied(&self, entry: &OutboxEntry) -> Result<bool> {
        for dependency in &entry.dependencies {
            if id_mapper::get_server_id(self.conn, &dependency.entity_type, &dependency.temp_id)?
                .is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Copy of `entry` with every mapped temporary id replaced
    ///
    /// Covers the entity id, the payload's `id`, declared foreign keys and
    /// any other temporary id nested in the payload. Unmapped temporary ids
    /// and permanent ids are left as they are. Call right before sending.
    pub fn resolve_payload_ids(&self, entry: &OutboxEntry) -> Result<OutboxEntry> {
        let mut resolved = entry.clone();
        resolved.entity_id = id_mapper::resolve_id(self.conn, &entry.entity_type, &entry.entity_id)?;

        if let Value::Object(payload) = &mut resolved.payload {
            for (field, value) in payload.iter_mut() {
                let target = if field == ID_FIELD {
                    Some(entry.entity_type.as_str())
                } else {
                    self.schema
                        .foreign_keys(&entry.entity_type)
                        .iter()
                        .find(|fk| fk.field == *field)
                        .map(|fk| fk.references.as_str())
                };
                match target {
                    Some(target) => resolve_typed(self.conn, target, value)?,
                    None => resolve_untyped(self.conn, value)?,
                }
            }
        } else {
            resolve_untyped(self.conn, &mut resolved.payload)?;
        }

        Ok(resolved)
    }

    /// `pending -> in_progress`, right before the transport call
    pub fn mark_in_progress(&self, seq: i64) -> Result<OutboxEntry> {
        let tx = self.conn.unchecked_transaction()?;
        let entry = require(&tx, seq)?;
        set_status(&tx, &entry, OutboxStatus::InProgress)?;
        tx.commit()?;

        tracing::debug!("Dispatching outbox entry {seq} ({} {})", entry.operation, entry.entity_type);
        require(self.conn, seq)
    }

    /// Server acknowledged the entry
    ///
    /// Stores the response and, when no other unresolved entry references the
    /// entity, clears its dirty flag. The entity's sync version is bumped
    /// either way.
    pub fn mark_synced(&self, seq: i64, server_response: Value) -> Result<OutboxEntry> {
        let tx = self.conn.unchecked_transaction()?;
        let entry = require(&tx, seq)?;
        set_status(&tx, &entry, OutboxStatus::Synced)?;
        tx.execute(
            "UPDATE _outbox SET server_response = ?1, last_error = NULL WHERE seq = ?2",
            params![serde_json::to_string(&server_response)?, seq],
        )?;

        let entity_id = id_mapper::resolve_id(&tx, &entry.entity_type, &entry.entity_id)?;
        if entry.operation != Operation::Delete {
            let still_dirty = has_unresolved(&tx, &entry.entity_type, &entity_id)?;
            let server_updated_at = server_response
                .get(SERVER_UPDATED_FIELD)
                .and_then(parse_timestamp_ms);
            entities::acknowledge(
                &tx,
                &entry.entity_type,
                &entity_id,
                still_dirty,
                server_updated_at,
            )?;
        }
        tx.commit()?;

        tracing::debug!("Outbox entry {seq} synced ({} {entity_id})", entry.entity_type);
        require(self.conn, seq)
    }

    /// Transport failure: count the attempt and either requeue or park the entry
    ///
    /// Once the retry count reaches `max_retries` the entry stays `failed` and
    /// is no longer retried automatically.
    pub fn mark_failed(&self, seq: i64, error: &str) -> Result<OutboxEntry> {
        let tx = self.conn.unchecked_transaction()?;
        let entry = require(&tx, seq)?;
        let failed = entry.status.transition(OutboxStatus::Failed)?;
        let retry_count = entry.retry_count.saturating_add(1);
        let status = if retry_count < self.config.max_retries {
            failed.transition(OutboxStatus::Pending)?
        } else {
            failed
        };

        tx.execute(
            "UPDATE _outbox
             SET status = ?1, retry_count = ?2, last_error = ?3, updated_at = ?4
             WHERE seq = ?5",
            params![status.as_str(), retry_count, error, now_ms(), seq],
        )?;
        tx.commit()?;

        if status == OutboxStatus::Failed {
            tracing::warn!(
                "Outbox entry {seq} failed {retry_count} times, giving up: {}",
                crate::util::compact_text(error)
            );
        } else {
            tracing::debug!("Outbox entry {seq} failed (attempt {retry_count}), requeued");
        }
        require(self.conn, seq)
    }

    /// Server reports a newer version: park the entry and log the conflict
    pub fn mark_conflict(&self, seq: i64, server_snapshot: Value) -> Result<SyncConflict> {
        let tx = self.conn.unchecked_transaction()?;
        let entry = require(&tx, seq)?;
        set_status(&tx, &entry, OutboxStatus::Conflict)?;
        tx.execute(
            "UPDATE _outbox SET server_response = ?1 WHERE seq = ?2",
            params![serde_json::to_string(&server_snapshot)?, seq],
        )?;
        let entity_id = id_mapper::resolve_id(&tx, &entry.entity_type, &entry.entity_id)?;
        let conflict = conflicts::record(
            &tx,
            &entry.entity_type,
            &entity_id,
            seq,
            &entry.payload,
            &server_snapshot,
        )?;
        tx.commit()?;

        tracing::warn!(
            "Conflict on {} {entity_id} (outbox entry {seq})",
            entry.entity_type
        );
        Ok(conflict)
    }

    /// Crash recovery: requeue everything that was in flight
    ///
    /// Run once at startup, before any dispatch.
    pub fn reset_in_progress(&self) -> Result<usize> {
        let reset = self.conn.execute(
            "UPDATE _outbox SET status = 'pending', updated_at = ?1 WHERE status = 'in_progress'",
            params![now_ms()],
        )?;
        if reset > 0 {
            tracing::info!("Requeued {reset} outbox entries left in progress");
        }
        Ok(reset)
    }

    /// Delete synced entries created before `now - retention`
    ///
    /// Entries in any other status are kept regardless of age.
    pub fn purge_synced(&self, retention: chrono::Duration) -> Result<usize> {
        let cutoff = now_ms().saturating_sub(retention.num_milliseconds());
        let purged = self.conn.execute(
            "DELETE FROM _outbox WHERE status = 'synced' AND created_at < ?1",
            params![cutoff],
        )?;
        if purged > 0 {
            tracing::info!("Purged {purged} synced outbox entries");
        }
        Ok(purged)
    }

    /// Manually requeue a terminally failed entry with a fresh retry budget
    pub fn retry(&self, seq: i64) -> Result<OutboxEntry> {
        let tx = self.conn.unchecked_transaction()?;
        let entry = require(&tx, seq)?;
        if entry.status != OutboxStatus::Failed {
            return Err(Error::InvalidTransition {
                from: entry.status,
                to: OutboxStatus::Pending,
            });
        }
        if let Some(dependency) = orphaned_dependency(&tx, &entry)? {
            return Err(Error::InvalidInput(format!(
                "entry {seq} can never be sent: {} {} will not get a server id",
                dependency.entity_type, dependency.temp_id
            )));
        }
        set_status(&tx, &entry, OutboxStatus::Pending)?;
        tx.execute(
            "UPDATE _outbox SET retry_count = 0, last_error = NULL WHERE seq = ?1",
            params![seq],
        )?;
        tx.commit()?;

        tracing::info!("Outbox entry {seq} requeued by user");
        require(self.conn, seq)
    }

    /// Drop an entry the user gave up on
    ///
    /// Failed and conflicting entries qualify, as does a pending entry that
    /// waits on a temporary id nothing will ever map.
    pub fn discard(&self, seq: i64) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        let entry = require(&tx, seq)?;
        let actionable = match entry.status {
            OutboxStatus::Failed | OutboxStatus::Conflict => true,
            OutboxStatus::Pending => orphaned_dependency(&tx, &entry)?.is_some(),
            OutboxStatus::InProgress | OutboxStatus::Synced => false,
        };
        if !actionable {
            return Err(Error::InvalidInput(format!(
                "only failed, conflicting or unsendable entries can be discarded (entry {seq} is {})",
                entry.status
            )));
        }
        discard_entry(&tx, &entry)?;
        conflicts::close_for_entry(&tx, seq, "discarded")?;
        tx.commit()?;

        tracing::info!("Outbox entry {seq} discarded by user");
        Ok(())
    }
}

fn parse_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        seq: row.get(0)?,
        correlation_id: row.get(1)?,
        entity_type: row.get(2)?,
        entity_id: row.get(3)?,
        temp_id: row.get(4)?,
        operation: row.get(5)?,
        payload: row.get(6)?,
        dependencies: row.get(7)?,
        status: row.get(8)?,
        retry_count: row.get(9)?,
        last_error: row.get(10)?,
        server_response: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

/// Column values before the JSON and enum columns are decoded
struct RawEntry {
    seq: i64,
    correlation_id: String,
    entity_type: String,
    entity_id: String,
    temp_id: Option<String>,
    operation: String,
    payload: String,
    dependencies: String,
    status: String,
    retry_count: u32,
    last_error: Option<String>,
    server_response: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<RawEntry> for OutboxEntry {
    type Error = Error;

    fn try_from(raw: RawEntry) -> Result<Self> {
        Ok(Self {
            seq: raw.seq,
            correlation_id: raw.correlation_id,
            entity_type: raw.entity_type,
            entity_id: raw.entity_id,
            temp_id: raw.temp_id,
            operation: raw.operation.parse()?,
            payload: serde_json::from_str(&raw.payload)?,
            dependencies: serde_json::from_str(&raw.dependencies)?,
            status: raw.status.parse()?,
            retry_count: raw.retry_count,
            last_error: raw.last_error,
            server_response: raw
                .server_response
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        })
    }
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, parse_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(OutboxEntry::try_from).collect()
}

pub(crate) fn get(conn: &Connection, seq: i64) -> Result<Option<OutboxEntry>> {
    conn.query_row(
        &format!("SELECT {COLUMNS} FROM _outbox WHERE seq = ?1"),
        params![seq],
        parse_entry,
    )
    .optional()?
    .map(OutboxEntry::try_from)
    .transpose()
}

pub(crate) fn require(conn: &Connection, seq: i64) -> Result<OutboxEntry> {
    get(conn, seq)?.ok_or(Error::EntryNotFound(seq))
}

/// Validate and apply a status change
///
/// The `status = ?` guard makes a concurrent change surface as an error
/// instead of being overwritten.
pub(crate) fn set_status(conn: &Connection, entry: &OutboxEntry, next: OutboxStatus) -> Result<()> {
    let next = entry.status.transition(next)?;
    let rows = conn.execute(
        "UPDATE _outbox SET status = ?1, updated_at = ?2 WHERE seq = ?3 AND status = ?4",
        params![next.as_str(), now_ms(), entry.seq, entry.status.as_str()],
    )?;
    if rows == 0 {
        return Err(Error::Database(format!(
            "outbox entry {} changed status concurrently",
            entry.seq
        )));
    }
    Ok(())
}

pub(crate) fn append(conn: &Connection, new: &NewEntry<'_>) -> Result<OutboxEntry> {
    let now = now_ms();
    let temp_id = is_temporary_id(new.entity_id).then_some(new.entity_id);

    conn.execute(
        "INSERT INTO _outbox (
            correlation_id, entity_type, entity_id, temp_id, operation, payload,
            dependencies, status, retry_count, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?8)",
        params![
            new_correlation_id(),
            new.entity_type,
            new.entity_id,
            temp_id,
            new.operation.as_str(),
            serde_json::to_string(new.payload)?,
            serde_json::to_string(new.dependencies)?,
            now,
        ],
    )?;

    let entry = require(conn, conn.last_insert_rowid())?;
    tracing::debug!(
        "Queued outbox entry {} ({} {} {}, {} dependencies)",
        entry.seq,
        entry.operation,
        entry.entity_type,
        entry.entity_id,
        entry.dependencies.len()
    );
    Ok(entry)
}

/// Entries (any status) recorded for one entity under any of its ids
pub(crate) fn entries_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<OutboxEntry>> {
    let mut entries = Vec::new();
    for alias in id_mapper::aliases(conn, entity_type, entity_id)? {
        entries.extend(query_entries(
            conn,
            &format!(
                "SELECT {COLUMNS} FROM _outbox
                 WHERE entity_type = ?1 AND (entity_id = ?2 OR temp_id = ?2)"
            ),
            params![entity_type, alias],
        )?);
    }
    entries.sort_by_key(|entry| entry.seq);
    entries.dedup_by_key(|entry| entry.seq);
    Ok(entries)
}

/// Whether any unresolved entry still references the entity
pub(crate) fn has_unresolved(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<bool> {
    Ok(entries_for_entity(conn, entity_type, entity_id)?
        .iter()
        .any(|entry| entry.status.is_unresolved()))
}

/// Re-derive the dirty flag from the outbox
pub(crate) fn refresh_dirty(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<()> {
    let dirty = has_unresolved(conn, entity_type, entity_id)?;
    entities::set_dirty(conn, entity_type, entity_id, dirty)
}

pub(crate) fn delete_for_entity(conn: &Connection, entity_type: &str, entity_id: &str) -> Result<usize> {
    let mut deleted = 0;
    for entry in entries_for_entity(conn, entity_type, entity_id)? {
        deleted += conn.execute("DELETE FROM _outbox WHERE seq = ?1", params![entry.seq])?;
    }
    Ok(deleted)
}

/// Unresolved entries listing `dependency`
fn dependents(conn: &Connection, dependency: &Dependency) -> Result<Vec<OutboxEntry>> {
    let candidates = query_entries(
        conn,
        &format!(
            "SELECT {COLUMNS} FROM _outbox
             WHERE status != 'synced' AND instr(dependencies, ?1) > 0"
        ),
        params![dependency.temp_id],
    )?;
    Ok(candidates
        .into_iter()
        .filter(|entry| entry.dependencies.contains(dependency))
        .collect())
}

/// True when no mapping exists for the dependency and no create is left
/// that could ever produce one
pub(crate) fn is_orphaned(conn: &Connection, dependency: &Dependency) -> Result<bool> {
    if id_mapper::get_server_id(conn, &dependency.entity_type, &dependency.temp_id)?.is_some() {
        return Ok(false);
    }
    let creates: i64 = conn.query_row(
        "SELECT COUNT(*) FROM _outbox
         WHERE entity_type = ?1 AND temp_id = ?2 AND operation = 'create'",
        params![dependency.entity_type, dependency.temp_id],
        |row| row.get(0),
    )?;
    Ok(creates == 0)
}

fn orphaned_dependency<'e>(conn: &Connection, entry: &'e OutboxEntry) -> Result<Option<&'e Dependency>> {
    for dependency in &entry.dependencies {
        if is_orphaned(conn, dependency)? {
            return Ok(Some(dependency));
        }
    }
    Ok(None)
}

/// Park pending entries waiting on a temporary id that will never be mapped
///
/// They move to `failed` with the reason in `last_error` so they show up as
/// actionable items instead of waiting forever.
pub(crate) fn fail_dependents(
    conn: &Connection,
    entity_type: &str,
    temp_id: &str,
    reason: &str,
) -> Result<usize> {
    let error = format!("depends on {entity_type} {temp_id}, which {reason}");
    let mut failed = 0;
    for entry in dependents(conn, &Dependency::new(entity_type, temp_id))? {
        if entry.status != OutboxStatus::Pending {
            continue;
        }
        set_status(conn, &entry, OutboxStatus::Failed)?;
        conn.execute(
            "UPDATE _outbox SET last_error = ?1 WHERE seq = ?2",
            params![error, entry.seq],
        )?;
        failed += 1;
    }
    if failed > 0 {
        tracing::warn!("Marked {failed} outbox entries failed: {error}");
    }
    Ok(failed)
}

/// Remove an entry and re-derive its entity's dirty flag
///
/// Dropping the create of an unsynced entity also fails everything still
/// waiting for its server id.
pub(crate) fn discard_entry(conn: &Connection, entry: &OutboxEntry) -> Result<()> {
    conn.execute("DELETE FROM _outbox WHERE seq = ?1", params![entry.seq])?;
    if let (Operation::Create, Some(temp_id)) = (entry.operation, entry.temp_id.as_deref()) {
        if is_orphaned(conn, &Dependency::new(&entry.entity_type, temp_id))? {
            fail_dependents(conn, &entry.entity_type, temp_id, "was discarded before it synced")?;
        }
    }
    let entity_id = id_mapper::resolve_id(conn, &entry.entity_type, &entry.entity_id)?;
    refresh_dirty(conn, &entry.entity_type, &entity_id)
}

fn resolve_typed(conn: &Connection, entity_type: &str, value: &mut Value) -> Result<()> {
    match value {
        Value::String(id) if is_temporary_id(id) => {
            *id = id_mapper::resolve_id(conn, entity_type, id)?;
        }
        Value::Array(items) => {
            for item in items {
                resolve_typed(conn, entity_type, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn resolve_untyped(conn: &Connection, value: &mut Value) -> Result<()> {
    match value {
        Value::String(id) if is_temporary_id(id) => {
            if let Some(server_id) = id_mapper::get_server_id_any(conn, id)? {
                *id = server_id;
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_untyped(conn, item)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                resolve_untyped(conn, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}
