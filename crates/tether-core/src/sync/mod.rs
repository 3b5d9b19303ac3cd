//! Push side of the sync orchestrator
//!
//! Drains the outbox against a caller-supplied [`Transport`], one entry at a
//! time and in dispatch order. Pulling is left to the caller, which feeds
//! server records to the repository's bulk upsert.

mod engine;
mod transport;

pub use engine::{DispatchContext, DispatchOutcome, PassReport, PlannedEntry, SyncEngine};
pub use transport::{Delivered, Transport, TransportError};
