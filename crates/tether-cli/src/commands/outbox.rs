use serde::Serialize;
use tether_core::db::Database;
use tether_core::sync::SyncEngine;
use tether_core::{OutboxEntry, OutboxStatus};

use crate::commands::common::{entry_to_item, format_outbox_lines, OutboxItem};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct PlanItem {
    pub ready: bool,
    #[serde(flatten)]
    pub entry: OutboxItem,
}

/// Entries with the given status, or every entry when none is given
pub fn list_entries(
    status: Option<OutboxStatus>,
    limit: usize,
    db: &Database,
) -> Result<Vec<OutboxEntry>, CliError> {
    let outbox = db.outbox();
    let mut entries = match status {
        Some(OutboxStatus::Pending) => outbox.get_pending_ordered()?,
        Some(status) => outbox.list_by_status(status)?,
        None => {
            let mut all = Vec::new();
            for status in OutboxStatus::ALL {
                all.extend(outbox.list_by_status(status)?);
            }
            all.sort_by_key(|entry| entry.seq);
            all
        }
    };
    entries.truncate(limit);
    Ok(entries)
}

pub fn run_outbox(
    status: Option<OutboxStatus>,
    limit: usize,
    as_json: bool,
    db: &Database,
) -> Result<(), CliError> {
    let entries = list_entries(status, limit, db)?;

    if as_json {
        let json_items = entries.iter().map(entry_to_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("Outbox is empty.");
        return Ok(());
    }

    for line in format_outbox_lines(&entries) {
        println!("{line}");
    }
    Ok(())
}

pub fn run_plan(as_json: bool, db: &Database) -> Result<(), CliError> {
    let plan = SyncEngine::new(db).plan()?;

    if as_json {
        let json_items = plan
            .iter()
            .map(|planned| PlanItem {
                ready: planned.ready,
                entry: entry_to_item(&planned.entry),
            })
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if plan.is_empty() {
        println!("Nothing to send.");
        return Ok(());
    }

    let entries = plan
        .iter()
        .map(|planned| planned.entry.clone())
        .collect::<Vec<_>>();
    for (planned, line) in plan.iter().zip(format_outbox_lines(&entries)) {
        let marker = if planned.ready { "ready  " } else { "waiting" };
        println!("{marker}  {line}");
    }
    Ok(())
}
