//! Database connection management

use std::path::Path;

use rusqlite::Connection;

use super::migrations;
use super::{ConflictLog, IdMapper, OutboxManager, SqliteEntityRepository, SyncMeta};
use crate::config::SyncConfig;
use crate::error::Result;
use crate::schema::EntitySchema;

/// Local store: one `SQLite` connection plus the schema and configuration
/// every component consults
pub struct Database {
    conn: Connection,
    schema: EntitySchema,
    config: SyncConfig,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations and creates any missing entity tables.
    pub fn open(path: impl AsRef<Path>, schema: EntitySchema, config: SyncConfig) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        tracing::debug!("Opened local store at {}", path.as_ref().display());
        Self::init(conn, schema, config)
    }

    /// Open a database whose schema is declared by `config`
    pub fn open_with_config(path: impl AsRef<Path>, config: SyncConfig) -> Result<Self> {
        let schema = EntitySchema::from_config(&config)?;
        Self::open(path, schema, config)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory(schema: EntitySchema, config: SyncConfig) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, schema, config)
    }

    fn init(conn: Connection, schema: EntitySchema, config: SyncConfig) -> Result<Self> {
        let database = Self {
            conn,
            schema,
            config,
        };
        database.configure();
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for a single-writer client store
    fn configure(&self) {
        // In-memory databases reject WAL; that's fine
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL;")
            .ok();
        self.conn
            .execute_batch("PRAGMA synchronous = NORMAL;")
            .ok();
        self.conn.execute_batch("PRAGMA cache_size = 10000;").ok();
    }

    /// Run control-table migrations, then make sure every entity table exists
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)?;
        migrations::ensure_entity_tables(&self.conn, &self.schema)
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    pub const fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The write path for domain entities
    pub const fn repository(&self) -> SqliteEntityRepository<'_> {
        SqliteEntityRepository::new(&self.conn, &self.schema)
    }

    pub const fn outbox(&self) -> OutboxManager<'_> {
        OutboxManager::new(&self.conn, &self.schema, &self.config)
    }

    pub const fn id_mapper(&self) -> IdMapper<'_> {
        IdMapper::new(&self.conn, &self.schema)
    }

    pub const fn conflicts(&self) -> ConflictLog<'_> {
        ConflictLog::new(&self.conn)
    }

    pub const fn sync_meta(&self) -> SyncMeta<'_> {
        SyncMeta::new(&self.conn)
    }
}
