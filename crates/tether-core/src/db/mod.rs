//! Local store for Tether

mod conflicts;
mod connection;
mod entities;
mod id_mapper;
mod migrations;
mod outbox;
mod repository;
mod sync_meta;

pub use conflicts::ConflictLog;
pub use connection::Database;
pub use id_mapper::{IdMapper, RepairReport};
pub use outbox::OutboxManager;
pub use repository::{EntityRepository, SqliteEntityRepository, UpsertReport};
pub use sync_meta::SyncMeta;
