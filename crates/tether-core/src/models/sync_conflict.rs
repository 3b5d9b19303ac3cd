//! Sync conflict model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Divergence between a local edit and the server's current version,
/// surfaced when the server rejected an outbox entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict row identifier
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    /// Outbox entry that surfaced the conflict
    pub outbox_seq: i64,
    /// Payload the client tried to send
    pub local_snapshot: Value,
    /// Version the server reported
    pub server_snapshot: Value,
    /// Detection timestamp (unix ms)
    pub detected_at: i64,
    /// Resolution timestamp (unix ms), 0 while unresolved
    pub resolved_at: i64,
    /// Resolution label once resolved
    pub resolution: Option<String>,
}

impl SyncConflict {
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved_at != 0
    }
}

/// How a user chose to settle a conflict
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Re-send the local version
    KeepLocal,
    /// Adopt the server version and drop the local change
    KeepServer,
    /// Store and re-send a hand-merged version
    Merge(Map<String, Value>),
}

impl Resolution {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::KeepLocal => "keep_local",
            Self::KeepServer => "keep_server",
            Self::Merge(_) => "merge",
        }
    }
}
