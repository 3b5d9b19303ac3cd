//! Outbox (change log) model

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Kind of mutation recorded in the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::Database(format!("unknown outbox operation '{other}'"))),
        }
    }
}

/// Lifecycle status of an outbox entry
///
/// ```text
/// pending -> in_progress -> synced | conflict | failed
/// in_progress -> pending      (crash recovery, retry below the ceiling)
/// pending -> failed           (a dependency was dropped before it synced)
/// failed -> pending           (retry)
/// conflict -> pending         (conflict resolved in favour of the client)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    InProgress,
    Synced,
    Conflict,
    Failed,
}

impl OutboxStatus {
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Synced,
        Self::Conflict,
        Self::Failed,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Synced => "synced",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// Anything but `synced` still keeps its entity dirty
    #[must_use]
    pub const fn is_unresolved(self) -> bool {
        !matches!(self, Self::Synced)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                // A dependency that can never be mapped
                | (Self::Pending, Self::Failed)
                | (
                    Self::InProgress,
                    Self::Synced | Self::Conflict | Self::Failed | Self::Pending
                )
                | (Self::Failed | Self::Conflict, Self::Pending)
        )
    }

    /// Move to `next`, rejecting anything the lifecycle does not allow
    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Database(format!("unknown outbox status '{s}'")))
    }
}

/// A temporary id that must be mapped before an entry may be dispatched
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub entity_type: String,
    pub temp_id: String,
}

impl Dependency {
    pub fn new(entity_type: impl Into<String>, temp_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            temp_id: temp_id.into(),
        }
    }
}

/// A durable, not-yet-acknowledged local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Local auto-incrementing sequence
    pub seq: i64,
    /// Globally unique id the server can use to deduplicate replays
    pub correlation_id: String,
    pub entity_type: String,
    /// Id at the time the entry was written (may still be temporary)
    pub entity_id: String,
    /// Set when the entity was created locally
    pub temp_id: Option<String>,
    pub operation: Operation,
    /// Full record for creates, the patch for updates, the id for deletes
    pub payload: Value,
    /// Temporary ids unresolved when the entry was written; never rewritten
    pub dependencies: Vec<Dependency>,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub server_response: Option<Value>,
    /// Original mutation time (unix ms)
    pub created_at: i64,
    /// Last status change (unix ms)
    pub updated_at: i64,
}
