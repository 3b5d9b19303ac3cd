use tether_core::db::Database;
use tether_core::models::Resolution;

use crate::commands::common::{conflict_to_item, format_conflict_lines, format_sync_timestamp};
use crate::error::CliError;

pub fn run_conflicts(all: bool, limit: usize, as_json: bool, db: &Database) -> Result<(), CliError> {
    let conflicts = db.conflicts().list(!all, limit)?;

    if as_json {
        let json_items = conflicts.iter().map(conflict_to_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub const fn resolution_from_flags(keep_local: bool) -> Resolution {
    if keep_local {
        Resolution::KeepLocal
    } else {
        Resolution::KeepServer
    }
}

pub fn run_resolve(id: i64, keep_local: bool, db: &Database) -> Result<(), CliError> {
    let conflict = db.conflicts().resolve(id, resolution_from_flags(keep_local))?;
    println!(
        "Resolved conflict {} on {} {} ({}) at {}",
        conflict.id,
        conflict.entity_type,
        conflict.entity_id,
        conflict.resolution.as_deref().unwrap_or_default(),
        format_sync_timestamp(conflict.resolved_at)
    );
    Ok(())
}
