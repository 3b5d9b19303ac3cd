//! Key-value bookkeeping for the sync layer

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

const LAST_PULL_AT: &str = "last_pull_at";
const LAST_PUSH_AT: &str = "last_push_at";

/// Small persistent settings such as pull cursors
pub struct SyncMeta<'a> {
    conn: &'a Connection,
}

impl<'a> SyncMeta<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM _sync_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO _sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Returns whether the key existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM _sync_meta WHERE key = ?1", params![key])?;
        Ok(rows > 0)
    }

    fn timestamp(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.get(key)?.and_then(|value| value.parse().ok()))
    }

    /// Time of the last successful pull (unix ms)
    pub fn last_pull_at(&self) -> Result<Option<i64>> {
        self.timestamp(LAST_PULL_AT)
    }

    pub fn set_last_pull_at(&self, timestamp_ms: i64) -> Result<()> {
        self.set(LAST_PULL_AT, &timestamp_ms.to_string())
    }

    /// End of the last push pass that sent anything (unix ms)
    pub fn last_push_at(&self) -> Result<Option<i64>> {
        self.timestamp(LAST_PUSH_AT)
    }

    pub fn set_last_push_at(&self, timestamp_ms: i64) -> Result<()> {
        self.set(LAST_PUSH_AT, &timestamp_ms.to_string())
    }
}
