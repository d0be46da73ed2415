//! Persistent queues backed by SQLite.
//!
//! Queues are named FIFOs of JSON values with optional per-entry TTLs.
//! The injection router keys queues by session id; observation history
//! uses a single shared queue. Entries survive daemon restarts — a
//! pending injection written before shutdown is consumed on the next
//! start.
//!
//! Writes are serialized behind a single connection; individual
//! statements are short enough to run inline on the async path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::StateResult;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS queue_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    value TEXT NOT NULL,
    pushed_at INTEGER NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_queue_entries_queue ON queue_entries (queue, id);
";

/// SQLite-backed named queues with TTL pruning.
pub struct AsyncStateStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for AsyncStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncStateStore").finish_non_exhaustive()
    }
}

impl AsyncStateStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// database cannot be opened/initialized.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "async-state database opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn open_in_memory() -> StateResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Append a value to a queue, with an optional TTL.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or database failure.
    pub async fn push(
        &self,
        queue: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> StateResult<i64> {
        let now = Utc::now().timestamp();
        let expires_at = ttl.and_then(|t| {
            i64::try_from(t.as_secs())
                .ok()
                .map(|secs| now.saturating_add(secs))
        });
        let serialized = serde_json::to_string(value)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO queue_entries (queue, value, pushed_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![queue, serialized, now, expires_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Pop the oldest non-expired value from a queue.
    ///
    /// Expired entries encountered on the way are deleted.
    ///
    /// # Errors
    ///
    /// Returns an error on database or deserialization failure.
    pub async fn pop(&self, queue: &str) -> StateResult<Option<Value>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM queue_entries WHERE queue = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![queue, now],
        )?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, value FROM queue_entries WHERE queue = ?1 ORDER BY id LIMIT 1",
                params![queue],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((id, serialized)) = row else {
            return Ok(None);
        };
        conn.execute("DELETE FROM queue_entries WHERE id = ?1", params![id])?;
        Ok(Some(serde_json::from_str(&serialized)?))
    }

    /// All non-expired values in a queue, oldest first, without
    /// consuming them.
    ///
    /// # Errors
    ///
    /// Returns an error on database or deserialization failure.
    pub async fn get_queue(&self, queue: &str) -> StateResult<Vec<Value>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT value FROM queue_entries
             WHERE queue = ?1 AND (expires_at IS NULL OR expires_at > ?2)
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![queue, now], |row| row.get::<_, String>(0))?;
        let mut values = Vec::new();
        for row in rows {
            values.push(serde_json::from_str(&row?)?);
        }
        Ok(values)
    }

    /// Number of non-expired entries in a queue.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn queue_length(&self, queue: &str) -> StateResult<usize> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_entries
             WHERE queue = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
            params![queue, now],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Remove every entry in a queue. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn clear(&self, queue: &str) -> StateResult<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute("DELETE FROM queue_entries WHERE queue = ?1", params![queue])?;
        Ok(removed)
    }

    /// Non-empty queues whose name starts with `prefix`, with their
    /// non-expired lengths.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn queues_with_prefix(
        &self,
        prefix: &str,
    ) -> StateResult<Vec<(String, usize)>> {
        let now = Utc::now().timestamp();
        let like = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT queue, COUNT(*) FROM queue_entries
             WHERE queue LIKE ?1 ESCAPE '\\'
               AND (expires_at IS NULL OR expires_at > ?2)
             GROUP BY queue ORDER BY queue",
        )?;
        let rows = stmt.query_map(params![like, now], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut queues = Vec::new();
        for row in rows {
            let (queue, count) = row?;
            queues.push((queue, usize::try_from(count).unwrap_or(0)));
        }
        Ok(queues)
    }

    /// Delete every expired entry across all queues. Returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    pub async fn prune_expired(&self) -> StateResult<usize> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM queue_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1",
            params![now],
        )?;
        if removed > 0 {
            debug!(removed, "pruned expired async-state entries");
        }
        Ok(removed)
    }

    /// Spawn a background task pruning expired entries on an interval.
    #[must_use]
    pub fn spawn_prune_loop(
        self: &Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = store.prune_expired().await {
                    warn!(error = %e, "async-state prune failed");
                }
            }
        })
    }
}
