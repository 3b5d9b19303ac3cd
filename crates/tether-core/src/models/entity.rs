//! Entity record model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::is_temporary_id;

/// Field carrying the primary identifier in payloads and server records.
pub const ID_FIELD: &str = "id";
/// Field carrying the organization scope.
pub const ORGANIZATION_FIELD: &str = "organization_id";
/// Field carrying the server-side last modification time in pulled records.
pub const SERVER_UPDATED_FIELD: &str = "updated_at";

/// A locally held domain entity of any declared type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Declared entity type (also the table name)
    pub entity_type: String,
    /// Temporary or permanent identifier
    pub id: String,
    /// Organization scope, mirrored from the `organization_id` field
    pub organization_id: Option<String>,
    /// Business fields, foreign keys included; never contains `id`
    pub fields: Map<String, Value>,
    /// Set while at least one unresolved outbox entry references the entity
    pub dirty: bool,
    /// Last local modification (unix ms)
    pub local_updated_at: i64,
    /// Server modification time seen during the last pull (unix ms)
    pub server_updated_at: Option<i64>,
    /// Bumped every time the server acknowledges or supplies a new version
    pub sync_version: i64,
}

impl EntityRecord {
    /// Whether the entity has never been acknowledged by the server
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        is_temporary_id(&self.id)
    }

    /// Look up a business field
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Full snapshot as sent to the server: business fields plus `id`
    #[must_use]
    pub fn to_payload(&self) -> Value {
        let mut payload = self.fields.clone();
        payload.insert(ID_FIELD.to_string(), Value::String(self.id.clone()));
        Value::Object(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> EntityRecord {
        let Value::Object(fields) = json!({ "name": "Troop 7", "organization_id": "org-1" }) else {
            unreachable!()
        };
        EntityRecord {
            entity_type: "groups".to_string(),
            id: id.to_string(),
            organization_id: Some("org-1".to_string()),
            fields,
            dirty: true,
            local_updated_at: 1,
            server_updated_at: None,
            sync_version: 0,
        }
    }

    #[test]
    fn payload_includes_id() {
        let payload = record("temp_abc").to_payload();
        assert_eq!(payload["id"], json!("temp_abc"));
        assert_eq!(payload["name"], json!("Troop 7"));
    }

    #[test]
    fn temporary_detection() {
        assert!(record("temp_abc").is_temporary());
        assert!(!record("42").is_temporary());
    }
}
