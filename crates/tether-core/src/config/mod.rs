//! Sync configuration.
//!
//! A `SyncConfig` declares the retry ceiling, the retention window for synced
//! outbox history, and the entity types the local store manages together with
//! their foreign keys. Clients ship it as JSON next to the database.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Runtime configuration for the sync core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Failed dispatch attempts before an entry is parked as `failed`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Synced outbox entries older than this are purged
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Entity types in dependency order (parents first)
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    /// Explicit dispatch order; defaults to the order of `entities`
    #[serde(default)]
    pub priority: Option<Vec<String>>,
}

/// One entity type and its foreign keys (field name -> referenced type).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, String>,
}

impl EntityConfig {
    pub fn new<'a>(
        name: impl Into<String>,
        foreign_keys: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Self {
        Self {
            name: name.into(),
            foreign_keys: foreign_keys
                .into_iter()
                .map(|(field, target)| (field.to_string(), target.to_string()))
                .collect(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retention_days: DEFAULT_RETENTION_DAYS,
            entities: Vec::new(),
            priority: None,
        }
    }
}

impl SyncConfig {
    /// Retention window for synced outbox history
    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    /// Override the retry ceiling
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Parse a configuration from a raw JSON payload.
pub fn parse_config(payload: &str) -> Result<SyncConfig> {
    let config: SyncConfig = serde_json::from_str(payload)?;
    if config.max_retries == 0 {
        return Err(Error::InvalidInput(
            "max_retries must be at least 1".to_string(),
        ));
    }
    Ok(config)
}

/// Load a configuration file from disk.
pub fn load_config(path: impl AsRef<Path>) -> Result<SyncConfig> {
    let payload = std::fs::read_to_string(path.as_ref())?;
    tracing::debug!("Loaded sync config from {}", path.as_ref().display());
    parse_config(&payload)
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_retention_days() -> u32 {
    DEFAULT_RETENTION_DAYS
}
