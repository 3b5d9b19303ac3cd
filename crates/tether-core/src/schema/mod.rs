//! Declarative entity schema.
//!
//! Lists the entity types the local store manages, the foreign-key fields
//! connecting them, and the order in which their outbox entries are
//! dispatched. Dependency extraction, cascade repair and outbox ordering all
//! consult this table, so adding an entity type is a schema change only.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{ID_FIELD, ORGANIZATION_FIELD};

/// Entity type and field names end up as SQL identifiers and JSON paths.
static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("Invalid regex"));

/// Tables owned by the store itself.
const RESERVED_TABLES: [&str; 1] = ["schema_version"];

/// A field holding the id of another entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: String,
    pub references: String,
}

/// One declared entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub name: String,
    pub foreign_keys: Vec<ForeignKey>,
}

/// The full set of entity types and their relationships
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    entities: Vec<EntityDef>,
    priority: Vec<String>,
}

impl EntitySchema {
    pub fn builder() -> EntitySchemaBuilder {
        EntitySchemaBuilder::default()
    }

    /// Build the schema declared by a configuration file
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let mut builder = Self::builder();
        for entity in &config.entities {
            builder = builder.entity(
                &entity.name,
                entity
                    .foreign_keys
                    .iter()
                    .map(|(field, target)| (field.as_str(), target.as_str())),
            );
        }
        if let Some(priority) = &config.priority {
            builder = builder.priority(priority.iter().map(String::as_str));
        }
        builder.build()
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|entity| entity.name == name)
    }

    /// Like [`Self::entity`] but fails for undeclared types
    pub fn require(&self, name: &str) -> Result<&EntityDef> {
        self.entity(name)
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &str> {
        self.entities.iter().map(|entity| entity.name.as_str())
    }

    /// Foreign keys declared on `entity_type` (empty for unknown types)
    pub fn foreign_keys(&self, entity_type: &str) -> &[ForeignKey] {
        self.entity(entity_type)
            .map(|entity| entity.foreign_keys.as_slice())
            .unwrap_or_default()
    }

    /// Every `(entity type, field)` pair pointing at `target`
    pub fn referencing(&self, target: &str) -> Vec<(&str, &str)> {
        self.entities
            .iter()
            .flat_map(|entity| {
                entity
                    .foreign_keys
                    .iter()
                    .filter(move |fk| fk.references == target)
                    .map(move |fk| (entity.name.as_str(), fk.field.as_str()))
            })
            .collect()
    }

    /// Dispatch rank of an entity type; types missing from the order sort last
    pub fn priority_of(&self, entity_type: &str) -> usize {
        self.priority
            .iter()
            .position(|name| name == entity_type)
            .unwrap_or(usize::MAX)
    }
}

/// Builder collecting entity declarations before validation
#[derive(Debug, Default)]
pub struct EntitySchemaBuilder {
    entities: Vec<EntityDef>,
    priority: Option<Vec<String>>,
}

impl EntitySchemaBuilder {
    /// Declare an entity type with `(field, referenced type)` foreign keys
    #[must_use]
    pub fn entity<'a>(
        mut self,
        name: &str,
        foreign_keys: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        self.entities.push(EntityDef {
            name: name.to_string(),
            foreign_keys: foreign_keys
                .into_iter()
                .map(|(field, references)| ForeignKey {
                    field: field.to_string(),
                    references: references.to_string(),
                })
                .collect(),
        });
        self
    }

    /// Override the dispatch order (declaration order by default)
    #[must_use]
    pub fn priority<'a>(mut self, order: impl IntoIterator<Item = &'a str>) -> Self {
        self.priority = Some(order.into_iter().map(str::to_string).collect());
        self
    }

    pub fn build(self) -> Result<EntitySchema> {
        for (index, entity) in self.entities.iter().enumerate() {
            validate_identifier(&entity.name, "entity type")?;
            if RESERVED_TABLES.contains(&entity.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "entity type '{}' collides with a control table",
                    entity.name
                )));
            }
            if self.entities[..index]
                .iter()
                .any(|other| other.name == entity.name)
            {
                return Err(Error::InvalidSchema(format!(
                    "entity type '{}' declared twice",
                    entity.name
                )));
            }

            for fk in &entity.foreign_keys {
                validate_identifier(&fk.field, "foreign key field")?;
                if fk.field == ID_FIELD || fk.field == ORGANIZATION_FIELD {
                    return Err(Error::InvalidSchema(format!(
                        "'{}.{}' is reserved and cannot be a foreign key",
                        entity.name, fk.field
                    )));
                }
                if !self.entities.iter().any(|e| e.name == fk.references) {
                    return Err(Error::InvalidSchema(format!(
                        "'{}.{}' references undeclared entity type '{}'",
                        entity.name, fk.field, fk.references
                    )));
                }
            }
        }

        let priority = match self.priority {
            Some(order) => {
                if let Some(unknown) = order
                    .iter()
                    .find(|name| !self.entities.iter().any(|e| &e.name == *name))
                {
                    return Err(Error::InvalidSchema(format!(
                        "priority lists undeclared entity type '{unknown}'"
                    )));
                }
                order
            }
            None => self.entities.iter().map(|e| e.name.clone()).collect(),
        };

        Ok(EntitySchema {
            entities: self.entities,
            priority,
        })
    }
}

fn validate_identifier(value: &str, what: &str) -> Result<()> {
    if IDENTIFIER_RE.is_match(value) {
        Ok(())
    } else {
        Err(Error::InvalidSchema(format!(
            "{what} '{value}' must match [a-z][a-z0-9_]*"
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::EntityConfig;
    use pretty_assertions::assert_eq;

    /// Schema shared by the store tests: groups own participants, attendance
    /// and honors point at participants and activities.
    pub(crate) fn youth_schema() -> EntitySchema {
        EntitySchema::builder()
            .entity("groups", [])
            .entity("participants", [("group_id", "groups")])
            .entity("activities", [("group_id", "groups")])
            .entity(
                "attendance",
                [
                    ("participant_id", "participants"),
                    ("activity_id", "activities"),
                ],
            )
            .entity("honors", [("participant_ids", "participants")])
            .build()
            .unwrap()
    }

    #[test]
    fn priority_defaults_to_declaration_order() {
        let schema = youth_schema();
        assert_eq!(schema.priority_of("groups"), 0);
        assert_eq!(schema.priority_of("participants"), 1);
        assert_eq!(schema.priority_of("honors"), 4);
        assert_eq!(schema.priority_of("badges"), usize::MAX);
    }

    #[test]
    fn explicit_priority_wins() {
        let schema = EntitySchema::builder()
            .entity("groups", [])
            .entity("participants", [("group_id", "groups")])
            .priority(["participants"])
            .build()
            .unwrap();
        assert_eq!(schema.priority_of("participants"), 0);
        assert_eq!(schema.priority_of("groups"), usize::MAX);
    }

    #[test]
    fn referencing_lists_every_pointer() {
        let schema = youth_schema();
        assert_eq!(
            schema.referencing("participants"),
            vec![("attendance", "participant_id"), ("honors", "participant_ids")]
        );
        assert_eq!(
            schema.referencing("groups"),
            vec![("participants", "group_id"), ("activities", "group_id")]
        );
        assert!(schema.referencing("honors").is_empty());
    }

    #[test]
    fn rejects_undeclared_reference() {
        let error = EntitySchema::builder()
            .entity("participants", [("group_id", "groups")])
            .build()
            .unwrap_err();
        assert!(error.to_string().contains("undeclared"));
    }

    #[test]
    fn rejects_unsafe_names() {
        assert!(EntitySchema::builder()
            .entity("groups; DROP TABLE x", [])
            .build()
            .is_err());
        assert!(EntitySchema::builder().entity("_outbox", []).build().is_err());
        assert!(EntitySchema::builder()
            .entity("groups", [])
            .entity("groups", [])
            .build()
            .is_err());
    }

    #[test]
    fn rejects_reserved_foreign_key_fields() {
        assert!(EntitySchema::builder()
            .entity("groups", [("id", "groups")])
            .build()
            .is_err());
    }

    #[test]
    fn from_config_matches_builder() {
        let config = SyncConfig {
            entities: vec![
                EntityConfig::new("groups", []),
                EntityConfig::new("participants", [("group_id", "groups")]),
            ],
            ..SyncConfig::default()
        };
        let schema = EntitySchema::from_config(&config).unwrap();
        assert_eq!(schema.entity_types().collect::<Vec<_>>(), ["groups", "participants"]);
        assert_eq!(
            schema.foreign_keys("participants"),
            [ForeignKey {
                field: "group_id".to_string(),
                references: "groups".to_string(),
            }]
        );
    }
}
