//! Database migrations

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;
use crate::schema::EntitySchema;

/// Current control-table schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .optional()?;

    Ok(version.unwrap_or(0))
}

/// Migration to version 1: change log, identifier map and sync metadata
fn migrate_v1(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS _outbox (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            correlation_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            temp_id TEXT,
            operation TEXT NOT NULL,
            payload TEXT NOT NULL,
            dependencies TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            server_response TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outbox_status_created ON _outbox(status, created_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_correlation ON _outbox(correlation_id);
        CREATE INDEX IF NOT EXISTS idx_outbox_entity ON _outbox(entity_type, entity_id);
        CREATE TABLE IF NOT EXISTS _id_map (
            entity_type TEXT NOT NULL,
            temp_id TEXT NOT NULL,
            server_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL,
            PRIMARY KEY (entity_type, temp_id)
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_id_map_server ON _id_map(entity_type, server_id);
        CREATE TABLE IF NOT EXISTS _sync_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        INSERT INTO schema_version (version) VALUES (1);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: conflict log
fn migrate_v2(conn: &Connection) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS _conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            outbox_seq INTEGER NOT NULL,
            local_snapshot TEXT NOT NULL,
            server_snapshot TEXT NOT NULL,
            detected_at INTEGER NOT NULL,
            resolved_at INTEGER NOT NULL DEFAULT 0,
            resolution TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_conflicts_resolved_at ON _conflicts(resolved_at);
        CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON _conflicts(entity_type, entity_id);
        INSERT INTO schema_version (version) VALUES (2);",
    )?;

    tx.commit()?;
    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

/// Create the table (and indexes) backing every declared entity type
///
/// Entity tables are derived from the schema rather than versioned, so a new
/// entity type only needs a schema entry.
pub fn ensure_entity_tables(conn: &Connection, schema: &EntitySchema) -> Result<()> {
    let tx = conn.unchecked_transaction()?;

    for entity_type in schema.entity_types() {
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{entity_type}\" (
                id TEXT PRIMARY KEY,
                organization_id TEXT,
                data TEXT NOT NULL,
                dirty INTEGER NOT NULL DEFAULT 0,
                local_updated_at INTEGER NOT NULL,
                server_updated_at INTEGER,
                sync_version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS \"idx_{entity_type}_organization\" ON \"{entity_type}\"(organization_id);
            CREATE INDEX IF NOT EXISTS \"idx_{entity_type}_dirty\" ON \"{entity_type}\"(dirty);"
        ))?;
    }

    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::youth_schema;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_control_tables_created() {
        let conn = setup();
        run(&conn).unwrap();

        for table in ["_outbox", "_id_map", "_sync_meta", "_conflicts"] {
            assert!(table_exists(&conn, table), "missing {table}");
        }
    }

    #[test]
    fn test_entity_tables_follow_schema() {
        let conn = setup();
        ensure_entity_tables(&conn, &youth_schema()).unwrap();
        ensure_entity_tables(&conn, &youth_schema()).unwrap();

        assert!(table_exists(&conn, "participants"));
        assert!(table_exists(&conn, "honors"));
        assert!(!table_exists(&conn, "badges"));
    }
}
