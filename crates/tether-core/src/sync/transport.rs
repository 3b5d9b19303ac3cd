//! Network collaborator contract

use serde_json::Value;
use thiserror::Error;

use crate::models::{OutboxEntry, ID_FIELD};
use crate::util::value_as_id;

/// Success envelope for one outbox entry
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    /// Id assigned by the server, for creates
    pub server_id: Option<String>,
    /// Body returned by the server, stored on the entry
    pub response: Value,
}

impl Delivered {
    pub const fn new(response: Value) -> Self {
        Self {
            server_id: None,
            response,
        }
    }

    pub fn created(server_id: impl Into<String>, response: Value) -> Self {
        Self {
            server_id: Some(server_id.into()),
            response,
        }
    }

    /// Explicit server id, else the `id` of the response body
    pub fn assigned_id(&self) -> Option<String> {
        self.server_id
            .clone()
            .or_else(|| self.response.get(ID_FIELD).and_then(value_as_id))
    }
}

/// Structured failure of a single network call
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connectivity or server-side failure; retried
    #[error("Network error: {0}")]
    Network(String),

    /// Validation rejection; retried until the ceiling, then surfaced
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// The server holds a newer version of the entity
    #[error("Server reports a newer version")]
    Conflict { server_version: Value },
}

/// Performs exactly one network call per outbox entry
///
/// The entry handed over already has its identifiers resolved. The
/// `correlation_id` lets the server deduplicate a replay after a crash.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn send(&self, entry: &OutboxEntry) -> Result<Delivered, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn assigned_id_prefers_explicit_id() {
        let delivered = Delivered::created("7", json!({ "id": 8 }));
        assert_eq!(delivered.assigned_id().as_deref(), Some("7"));

        let delivered = Delivered::new(json!({ "id": 8 }));
        assert_eq!(delivered.assigned_id().as_deref(), Some("8"));

        assert_eq!(Delivered::new(json!({})).assigned_id(), None);
    }
}
