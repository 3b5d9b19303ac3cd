use std::collections::BTreeMap;

use serde::Serialize;
use tether_core::db::Database;

use crate::commands::common::format_optional_timestamp;
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub outbox: BTreeMap<String, usize>,
    pub pending: usize,
    pub unresolved_conflicts: usize,
    pub last_pull_at: Option<i64>,
    pub last_push_at: Option<i64>,
}

pub fn collect_status(db: &Database) -> Result<StatusReport, CliError> {
    let outbox = db
        .outbox()
        .status_counts()?
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();
    let meta = db.sync_meta();

    Ok(StatusReport {
        outbox,
        pending: db.outbox().pending_count()?,
        unresolved_conflicts: db.conflicts().unresolved_count()?,
        last_pull_at: meta.last_pull_at()?,
        last_push_at: meta.last_push_at()?,
    })
}

pub fn run_status(as_json: bool, db: &Database) -> Result<(), CliError> {
    let report = collect_status(db)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Pending entries:      {}", report.pending);
    for (status, count) in db.outbox().status_counts()? {
        println!("  {:<18}  {count}", status.as_str());
    }
    println!("Unresolved conflicts: {}", report.unresolved_conflicts);
    println!(
        "Last pull:            {}",
        format_optional_timestamp(report.last_pull_at)
    );
    println!(
        "Last push:            {}",
        format_optional_timestamp(report.last_push_at)
    );
    Ok(())
}
