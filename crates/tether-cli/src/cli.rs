use std::path::PathBuf;

use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use tether_core::OutboxStatus;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Inspect and repair the offline change log of a Tether store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional path to the sync configuration (JSON)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show outbox backlog, conflicts and sync timestamps
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List outbox entries
    Outbox {
        /// Only entries with this status
        #[arg(long, value_enum)]
        status: Option<StatusFilter>,
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show pending entries in dispatch order, as they would be sent now
    Plan {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List sync conflicts
    Conflicts {
        /// Include resolved conflicts
        #[arg(long)]
        all: bool,
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Settle a conflict
    #[command(group(ArgGroup::new("side").required(true).args(["keep_local", "keep_server"])))]
    Resolve {
        /// Conflict id
        id: i64,
        /// Re-send the local version
        #[arg(long)]
        keep_local: bool,
        /// Adopt the server version and drop the local change
        #[arg(long)]
        keep_server: bool,
    },
    /// Requeue a failed entry with a fresh retry budget
    Retry {
        /// Outbox sequence number
        seq: i64,
    },
    /// Drop a failed or conflicting entry, or one that can never be sent
    Discard {
        /// Outbox sequence number
        seq: i64,
    },
    /// Requeue entries left in progress by an interrupted sync
    Recover,
    /// Delete synced entries older than the retention window
    Purge {
        /// Retention in days (defaults to the configured window)
        #[arg(long, value_name = "DAYS")]
        days: Option<u32>,
    },
    /// List temporary-to-server id mappings of an entity type
    Mappings {
        /// Entity type
        entity_type: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StatusFilter {
    Pending,
    InProgress,
    Synced,
    Conflict,
    Failed,
}

impl From<StatusFilter> for OutboxStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Pending => Self::Pending,
            StatusFilter::InProgress => Self::InProgress,
            StatusFilter::Synced => Self::Synced,
            StatusFilter::Conflict => Self::Conflict,
            StatusFilter::Failed => Self::Failed,
        }
    }
}
