//! tether-core - Core library for Tether
//!
//! This crate contains the local store, the outbox (change log), the
//! identifier mapper and the dispatch engine used by offline-first clients to
//! reconcile local edits with a remote server.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod schema;
pub mod sync;
pub mod util;


pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{
    Dependency, EntityRecord, IdMapping, Operation, OutboxEntry, OutboxStatus, SyncConflict,
};
pub use schema::EntitySchema;
