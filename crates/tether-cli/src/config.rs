//! Database and sync configuration paths

use std::env;
use std::path::{Path, PathBuf};

use tether_core::config::{load_config, EntityConfig};
use tether_core::SyncConfig;

use crate::error::CliError;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> Result<PathBuf, CliError> {
    match cli_db_path.or_else(|| env::var_os("TETHER_DB_PATH").map(PathBuf::from)) {
        Some(path) => Ok(path),
        None => default_db_path(),
    }
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("tether").join("tether.db"))
        .ok_or_else(|| CliError::Config("failed to resolve the data directory".to_string()))
}

pub fn resolve_config_path(cli_config: Option<PathBuf>) -> Option<PathBuf> {
    cli_config.or_else(|| env::var_os("TETHER_CONFIG").map(PathBuf::from))
}

/// Configuration file when one is given, the built-in schema otherwise
pub fn load_sync_config(path: Option<&Path>) -> Result<SyncConfig, CliError> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(default_sync_config()),
    }
}

/// Youth-program schema the CLI falls back to
pub fn default_sync_config() -> SyncConfig {
    SyncConfig {
        entities: vec![
            EntityConfig::new("groups", []),
            EntityConfig::new("participants", [("group_id", "groups")]),
            EntityConfig::new("activities", [("group_id", "groups")]),
            EntityConfig::new(
                "attendance",
                [
                    ("participant_id", "participants"),
                    ("activity_id", "activities"),
                ],
            ),
            EntityConfig::new("honors", [("participant_ids", "participants")]),
        ],
        ..SyncConfig::default()
    }
}
