//! Error types for tether-core

use thiserror::Error;

use crate::models::OutboxStatus;

/// Result type alias using tether-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tether-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Mutation or lookup targets an entity that does not exist locally
    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: String, id: String },

    /// Outbox entry not found
    #[error("Outbox entry not found: {0}")]
    EntryNotFound(i64),

    /// Conflict record not found
    #[error("Conflict not found: {0}")]
    ConflictNotFound(i64),

    /// A temporary id is already mapped to a different server id
    #[error(
        "{entity_type} {temp_id} is already mapped to {existing}, refusing to remap to {attempted}"
    )]
    DuplicateMapping {
        entity_type: String,
        temp_id: String,
        existing: String,
        attempted: String,
    },

    /// Outbox status change not allowed by the lifecycle
    #[error("Illegal outbox transition: {from} -> {to}")]
    InvalidTransition { from: OutboxStatus, to: OutboxStatus },

    /// Entity type is not declared in the schema
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Schema or configuration is invalid
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn not_found(entity_type: &str, id: &str) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_string(),
            id: id.to_string(),
        }
    }
}
