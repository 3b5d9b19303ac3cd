pub mod common;
pub mod conflicts;
pub mod maintenance;
pub mod outbox;
pub mod status;
