use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tether_core::db::Database;
use tether_core::{OutboxEntry, SyncConfig, SyncConflict};

use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct OutboxItem {
    pub seq: i64,
    pub correlation_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub status: String,
    pub retry_count: u32,
    pub dependencies: Vec<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub relative_time: String,
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub outbox_seq: i64,
    pub detected_at: i64,
    pub detected_at_iso: String,
    pub resolved_at: i64,
    pub resolution: Option<String>,
    pub local: Value,
    pub server: Value,
}

/// Open the store, creating the parent directory on first use
pub fn open_database(path: &Path, config: SyncConfig) -> Result<Database, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(Database::open_with_config(path, config)?)
}

pub fn entry_to_item(entry: &OutboxEntry) -> OutboxItem {
    let now_ms = Utc::now().timestamp_millis();
    OutboxItem {
        seq: entry.seq,
        correlation_id: entry.correlation_id.clone(),
        entity_type: entry.entity_type.clone(),
        entity_id: entry.entity_id.clone(),
        operation: entry.operation.to_string(),
        status: entry.status.to_string(),
        retry_count: entry.retry_count,
        dependencies: entry
            .dependencies
            .iter()
            .map(|dependency| format!("{}/{}", dependency.entity_type, dependency.temp_id))
            .collect(),
        last_error: entry.last_error.clone(),
        created_at: entry.created_at,
        relative_time: format_relative_time(entry.created_at, now_ms),
        payload: entry.payload.clone(),
    }
}

pub fn format_outbox_lines(entries: &[OutboxEntry]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    entries
        .iter()
        .map(|entry| {
            let target = format!("{} {}", entry.entity_type, short_id(&entry.entity_id));
            let relative_time = format_relative_time(entry.created_at, now_ms);
            let mut line = format!(
                "{:>6}  {:<11}  {:<6}  {target:<32}  {relative_time}",
                entry.seq,
                entry.status.as_str(),
                entry.operation.as_str()
            );
            if entry.retry_count > 0 {
                line.push_str(&format!("  retries={}", entry.retry_count));
            }
            if let Some(error) = &entry.last_error {
                line.push_str(&format!("  error={}", preview(error, 60)));
            }
            line
        })
        .collect()
}

pub fn conflict_to_item(conflict: &SyncConflict) -> ConflictItem {
    ConflictItem {
        id: conflict.id,
        entity_type: conflict.entity_type.clone(),
        entity_id: conflict.entity_id.clone(),
        outbox_seq: conflict.outbox_seq,
        detected_at: conflict.detected_at,
        detected_at_iso: format_sync_timestamp(conflict.detected_at),
        resolved_at: conflict.resolved_at,
        resolution: conflict.resolution.clone(),
        local: conflict.local_snapshot.clone(),
        server: conflict.server_snapshot.clone(),
    }
}

pub fn format_conflict_lines(conflicts: &[SyncConflict]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{:>4}  {}  {} {}  entry={}  {}",
                conflict.id,
                format_sync_timestamp(conflict.detected_at),
                conflict.entity_type,
                conflict.entity_id,
                conflict.outbox_seq,
                conflict.resolution.as_deref().unwrap_or("open")
            )
        })
        .collect()
}

/// Temporary ids are long; keep enough to tell them apart
pub fn short_id(id: &str) -> String {
    if id.chars().count() <= 20 {
        id.to_string()
    } else {
        let mut truncated = id.chars().take(17).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn preview(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_sync_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_optional_timestamp(timestamp_ms: Option<i64>) -> String {
    timestamp_ms.map_or_else(|| "never".to_string(), format_sync_timestamp)
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
