use tether_core::db::Database;
use tether_core::sync::SyncEngine;

use crate::commands::common::{format_sync_timestamp, short_id};
use crate::error::CliError;

pub fn run_retry(seq: i64, db: &Database) -> Result<(), CliError> {
    let entry = db.outbox().retry(seq)?;
    println!(
        "Requeued entry {} ({} {} {})",
        entry.seq,
        entry.operation,
        entry.entity_type,
        short_id(&entry.entity_id)
    );
    Ok(())
}

pub fn run_discard(seq: i64, db: &Database) -> Result<(), CliError> {
    db.outbox().discard(seq)?;
    println!("Discarded entry {seq}");
    Ok(())
}

pub fn run_recover(db: &Database) -> Result<usize, CliError> {
    let reset = SyncEngine::new(db).startup()?;
    println!("Requeued {reset} interrupted entries");
    Ok(reset)
}

pub fn run_purge(days: Option<u32>, db: &Database) -> Result<usize, CliError> {
    let retention = days.map_or_else(
        || db.config().retention(),
        |days| chrono::Duration::days(i64::from(days)),
    );
    let purged = db.outbox().purge_synced(retention)?;
    match chrono::Utc::now().checked_sub_signed(retention) {
        Some(cutoff) => println!(
            "Purged {purged} synced entries created before {}",
            format_sync_timestamp(cutoff.timestamp_millis())
        ),
        None => println!("Purged {purged} synced entries (retention reaches past the earliest date)"),
    }
    Ok(purged)
}

pub fn run_mappings(entity_type: &str, as_json: bool, db: &Database) -> Result<(), CliError> {
    db.schema().require(entity_type)?;
    let mappings = db.id_mapper().list_mappings(entity_type)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&mappings)?);
        return Ok(());
    }

    if mappings.is_empty() {
        println!("No {entity_type} ids mapped yet.");
        return Ok(());
    }

    for mapping in mappings {
        println!(
            "{}  {} -> {}",
            format_sync_timestamp(mapping.resolved_at),
            mapping.temp_id,
            mapping.server_id
        );
    }
    Ok(())
}
