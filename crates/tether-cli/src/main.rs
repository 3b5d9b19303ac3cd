//! Tether CLI - inspect and repair the offline change log of a local store
//!
//! Shows the outbox backlog and conflicts, and offers the manual actions
//! (retry, discard, resolve, recover, purge) a user needs when sync stalls.

mod cli;
mod commands;
mod config;
mod error;

use clap::{CommandFactory, Parser};

use crate::cli::{Cli, Commands};
use crate::commands::common::open_database;
use crate::commands::conflicts::{run_conflicts, run_resolve};
use crate::commands::maintenance::{run_discard, run_mappings, run_purge, run_recover, run_retry};
use crate::commands::outbox::{run_outbox, run_plan};
use crate::commands::status::run_status;
use crate::config::{load_sync_config, resolve_config_path, resolve_db_path};
use crate::error::CliError;

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tether_core=info".parse().map_err(|error| {
                    CliError::Config(format!("invalid log directive: {error}"))
                })?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    let db_path = resolve_db_path(cli.db_path)?;
    let config_path = resolve_config_path(cli.config);
    let config = load_sync_config(config_path.as_deref())?;
    let db = open_database(&db_path, config)?;

    match command {
        Commands::Status { json } => run_status(json, &db)?,
        Commands::Outbox {
            status,
            limit,
            json,
        } => run_outbox(status.map(Into::into), limit, json, &db)?,
        Commands::Plan { json } => run_plan(json, &db)?,
        Commands::Conflicts { all, limit, json } => run_conflicts(all, limit, json, &db)?,
        Commands::Resolve {
            id,
            keep_local,
            keep_server: _,
        } => run_resolve(id, keep_local, &db)?,
        Commands::Retry { seq } => run_retry(seq, &db)?,
        Commands::Discard { seq } => run_discard(seq, &db)?,
        Commands::Recover => {
            run_recover(&db)?;
        }
        Commands::Purge { days } => {
            run_purge(days, &db)?;
        }
        Commands::Mappings { entity_type, json } => run_mappings(&entity_type, json, &db)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests;
