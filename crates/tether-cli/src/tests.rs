use std::path::PathBuf;

use clap::Parser;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::tempdir;
use tether_core::db::{Database, EntityRepository};
use tether_core::models::Resolution;
use tether_core::{EntitySchema, OutboxStatus};

use crate::cli::{Cli, Commands, StatusFilter};
use crate::commands::common::{
    entry_to_item, format_outbox_lines, format_relative_time, format_sync_timestamp, open_database,
    preview, short_id,
};
use crate::commands::conflicts::resolution_from_flags;
use crate::commands::maintenance::{run_discard, run_purge, run_recover, run_retry};
use crate::commands::outbox::list_entries;
use crate::commands::status::collect_status;
use crate::config::{default_sync_config, load_sync_config, resolve_db_path};

fn fields(value: Value) -> serde_json::Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

fn temp_database() -> (tempfile::TempDir, Database) {
    let dir = tempdir().unwrap();
    let db = open_database(&dir.path().join("nested").join("tether.db"), default_sync_config())
        .unwrap();
    (dir, db)
}

#[test]
fn default_config_builds_a_valid_schema() {
    let schema = EntitySchema::from_config(&default_sync_config()).unwrap();
    assert_eq!(
        schema.entity_types().collect::<Vec<_>>(),
        ["groups", "participants", "activities", "attendance", "honors"]
    );
    assert_eq!(schema.referencing("participants").len(), 2);
}

#[test]
fn explicit_db_path_wins() {
    let path = resolve_db_path(Some(PathBuf::from("/tmp/explicit.db"))).unwrap();
    assert_eq!(path, PathBuf::from("/tmp/explicit.db"));
}

#[test]
fn load_sync_config_reads_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sync.json");
    std::fs::write(
        &path,
        r#"{ "max_retries": 3, "entities": [{ "name": "notes" }] }"#,
    )
    .unwrap();

    let config = load_sync_config(Some(path.as_path())).unwrap();
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.entities.len(), 1);

    assert_eq!(load_sync_config(None).unwrap(), default_sync_config());
}

#[test]
fn load_sync_config_rejects_unknown_keys() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("sync.json");
    std::fs::write(&path, r#"{ "max_retry": 3 }"#).unwrap();

    assert!(load_sync_config(Some(path.as_path())).is_err());
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 24 * 60 * 60_000, now), "3d ago");
    assert_eq!(format_relative_time(now - 21 * 24 * 60 * 60_000, now), "3w ago");
}

#[test]
fn format_sync_timestamp_is_utc() {
    assert_eq!(format_sync_timestamp(0), "1970-01-01 00:00:00 UTC");
}

#[test]
fn short_id_truncates_temporary_ids() {
    assert_eq!(short_id("100"), "100");
    assert_eq!(
        short_id("temp_0190b1c2d3e4f5a6b7c8d9e0f1a2b3c4"),
        "temp_0190b1c2d3e4..."
    );
}

#[test]
fn preview_collapses_whitespace() {
    assert_eq!(preview("connection\n  reset", 40), "connection reset");
    assert_eq!(preview("abcdefghij", 8), "abcde...");
}

#[test]
fn resolve_flags_map_to_resolutions() {
    assert_eq!(resolution_from_flags(true), Resolution::KeepLocal);
    assert_eq!(resolution_from_flags(false), Resolution::KeepServer);
}

#[test]
fn resolve_requires_a_side() {
    assert!(Cli::try_parse_from(["tether", "resolve", "3"]).is_err());
    assert!(Cli::try_parse_from(["tether", "resolve", "3", "--keep-local", "--keep-server"]).is_err());

    let cli = Cli::try_parse_from(["tether", "resolve", "3", "--keep-server"]).unwrap();
    assert!(matches!(
        cli.command,
        Some(Commands::Resolve {
            id: 3,
            keep_local: false,
            keep_server: true
        })
    ));
}

#[test]
fn outbox_status_filter_parses() {
    let cli = Cli::try_parse_from(["tether", "outbox", "--status", "in-progress", "--json"]).unwrap();
    let Some(Commands::Outbox { status, json, .. }) = cli.command else {
        panic!("expected outbox command");
    };
    assert_eq!(status, Some(StatusFilter::InProgress));
    assert_eq!(OutboxStatus::from(StatusFilter::InProgress), OutboxStatus::InProgress);
    assert!(json);
}

#[test]
fn list_entries_filters_and_limits() {
    let (_dir, db) = temp_database();
    let repo = db.repository();
    let group = repo.create("groups", fields(json!({ "name": "Troop" }))).unwrap();
    repo.create("participants", fields(json!({ "name": "Ada", "group_id": group.id })))
        .unwrap();
    repo.create("groups", fields(json!({ "name": "Pack" }))).unwrap();

    let all = list_entries(None, 10, &db).unwrap();
    assert_eq!(all.len(), 3);

    let pending = list_entries(Some(OutboxStatus::Pending), 2, &db).unwrap();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|entry| entry.entity_type == "groups"));

    assert!(list_entries(Some(OutboxStatus::Failed), 10, &db)
        .unwrap()
        .is_empty());

    let item = entry_to_item(&all[1]);
    assert_eq!(item.dependencies, vec![format!("groups/{}", group.id)]);
    assert_eq!(format_outbox_lines(&all).len(), 3);
}

#[test]
fn status_reports_backlog() {
    let (_dir, db) = temp_database();
    db.repository()
        .create("groups", fields(json!({ "name": "Troop" })))
        .unwrap();

    let status = collect_status(&db).unwrap();
    assert_eq!(status.pending, 1);
    assert_eq!(status.outbox["pending"], 1);
    assert_eq!(status.outbox["failed"], 0);
    assert_eq!(status.unresolved_conflicts, 0);
    assert_eq!(status.last_pull_at, None);
}

#[test]
fn recover_and_purge() {
    let (_dir, db) = temp_database();
    db.repository()
        .create("groups", fields(json!({ "name": "Troop" })))
        .unwrap();
    let seq = db.outbox().get_pending_ordered().unwrap()[0].seq;
    db.outbox().mark_in_progress(seq).unwrap();

    assert_eq!(run_recover(&db).unwrap(), 1);
    assert_eq!(run_purge(Some(0), &db).unwrap(), 0);
}

#[test]
fn purge_accepts_the_largest_retention() {
    let (_dir, db) = temp_database();
    db.repository()
        .create("groups", fields(json!({ "name": "Troop" })))
        .unwrap();

    assert_eq!(run_purge(Some(u32::MAX), &db).unwrap(), 0);
    assert_eq!(db.outbox().pending_count().unwrap(), 1);
}

#[test]
fn retry_and_discard_reject_pending_entries() {
    let (_dir, db) = temp_database();
    db.repository()
        .create("groups", fields(json!({ "name": "Troop" })))
        .unwrap();
    let seq = db.outbox().get_pending_ordered().unwrap()[0].seq;

    assert!(run_retry(seq, &db).is_err());
    assert!(run_discard(seq, &db).is_err());
    assert!(run_retry(999, &db).is_err());
}
