//! Data models for Tether

mod entity;
mod id_mapping;
mod outbox;
mod sync_conflict;

pub use entity::{EntityRecord, ID_FIELD, ORGANIZATION_FIELD, SERVER_UPDATED_FIELD};
pub use id_mapping::IdMapping;
pub use outbox::{Dependency, Operation, OutboxEntry, OutboxStatus};
pub use sync_conflict::{Resolution, SyncConflict};
