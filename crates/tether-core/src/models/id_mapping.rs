//! Identifier mapping model

use serde::{Deserialize, Serialize};

/// Correspondence between a locally generated id and the id the server assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub entity_type: String,
    pub temp_id: String,
    pub server_id: String,
    /// When the row was written (unix ms)
    pub created_at: i64,
    /// When the server acknowledged the entity (unix ms)
    pub resolved_at: i64,
}
