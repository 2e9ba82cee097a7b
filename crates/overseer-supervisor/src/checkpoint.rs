use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use overseer_core::error::{OverseerError, Result};
use overseer_core::traits::{Checkpoint, CheckpointSink};
use overseer_core::{Clock, SystemClock};

/// Per-session counts for listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub checkpoints: usize,
    pub latest: DateTime<Utc>,
}

/// Persistent checkpoint store backed by SQLite.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> OverseerError + '_ {
    move |e| OverseerError::Database(format!("{}: {}", context, e))
}

// Fixed-width UTC timestamps so text order matches time order.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const COLUMNS: &str = "checkpoint_id, session_id, timestamp, data, metadata";

fn row_to_checkpoint(row: &Row<'_>) -> rusqlite::Result<(String, String, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(raw: (String, String, String, String, Option<String>)) -> Result<Checkpoint> {
    let (checkpoint_id, session_id, timestamp, data, metadata) = raw;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OverseerError::Checkpoint(format!("bad timestamp '{}': {}", timestamp, e)))?;
    Ok(Checkpoint {
        checkpoint_id,
        session_id,
        timestamp,
        data: serde_json::from_str(&data)?,
        metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
    })
}

impl CheckpointStore {
    /// Open or create the checkpoint database.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(db_err("Failed to open checkpoint store"))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS checkpoints (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 checkpoint_id TEXT NOT NULL UNIQUE,
                 session_id TEXT NOT NULL,
                 timestamp TEXT NOT NULL,
                 data TEXT NOT NULL,
                 metadata TEXT
             );

             CREATE INDEX IF NOT EXISTS idx_cp_session_time
                 ON checkpoints(session_id, timestamp DESC);",
        )
        .map_err(db_err("Failed to initialize checkpoint schema"))?;

        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn query(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Checkpoint>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map(args, row_to_checkpoint)
            .map_err(db_err("Failed to query checkpoints"))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode(row.map_err(db_err("Failed to read checkpoint"))?)?);
        }
        Ok(out)
    }

    /// Load one checkpoint by id.
    pub fn load(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let raw = {
            let conn = self.conn();
            conn.query_row(
                &format!("SELECT {} FROM checkpoints WHERE checkpoint_id = ?1", COLUMNS),
                params![checkpoint_id],
                row_to_checkpoint,
            )
            .optional()
            .map_err(db_err("Failed to load checkpoint"))?
        };
        raw.map(decode).transpose()
    }

    /// Delete one checkpoint. Returns whether it existed.
    pub fn delete(&self, checkpoint_id: &str) -> Result<bool> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM checkpoints WHERE checkpoint_id = ?1",
                params![checkpoint_id],
            )
            .map_err(db_err("Failed to delete checkpoint"))?;
        Ok(deleted > 0)
    }

    /// Delete all checkpoints for a session.
    pub fn delete_session(&self, session_id: &str) -> Result<usize> {
        self.conn()
            .execute(
                "DELETE FROM checkpoints WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(db_err("Failed to delete checkpoints"))
    }

    /// Sessions with their checkpoint count, most recently active first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT session_id, COUNT(*), MAX(timestamp)
                 FROM checkpoints
                 GROUP BY session_id
                 ORDER BY MAX(timestamp) DESC",
            )
            .map_err(db_err("Failed to prepare query"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(db_err("Failed to list sessions"))?;

        let mut out = Vec::new();
        for row in rows {
            let (session_id, count, latest) = row.map_err(db_err("Failed to read session"))?;
            let latest = DateTime::parse_from_rfc3339(&latest)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| OverseerError::Checkpoint(e.to_string()))?;
            out.push(SessionSummary {
                session_id,
                checkpoints: count as usize,
                latest,
            });
        }
        Ok(out)
    }

    /// Checkpoints of a session taken within `[from, to]`, newest first.
    pub fn query_range(
        &self,
        session_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Checkpoint>> {
        self.query(
            &format!(
                "SELECT {} FROM checkpoints
                 WHERE session_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3
                 ORDER BY timestamp DESC, seq DESC",
                COLUMNS
            ),
            &[&session_id, &ts(from), &ts(to)],
        )
    }

    /// Checkpoints of a session whose metadata has `key` equal to `value`.
    pub fn query_metadata(
        &self,
        session_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<Checkpoint>> {
        Ok(self
            .load_all(session_id)?
            .into_iter()
            .filter(|cp| {
                cp.metadata
                    .as_ref()
                    .and_then(|m| m.get(key))
                    .is_some_and(|v| v == value)
            })
            .collect())
    }

    /// Delete checkpoints older than `age`. Returns how many were removed.
    pub fn cleanup_older_than(&self, age: Duration) -> Result<usize> {
        let age = chrono::Duration::from_std(age)
            .map_err(|e| OverseerError::Checkpoint(e.to_string()))?;
        let cutoff = ts(self.clock.now() - age);
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM checkpoints WHERE timestamp < ?1",
                params![cutoff],
            )
            .map_err(db_err("Failed to clean up checkpoints"))?;
        debug!(deleted, "Old checkpoints removed");
        Ok(deleted)
    }

    /// Number of checkpoints, for one session or overall.
    pub fn count(&self, session_id: Option<&str>) -> Result<usize> {
        let conn = self.conn();
        let n: i64 = match session_id {
            Some(id) => conn.query_row(
                "SELECT COUNT(*) FROM checkpoints WHERE session_id = ?1",
                params![id],
                |row| row.get(0),
            ),
            None => conn.query_row("SELECT COUNT(*) FROM checkpoints", [], |row| row.get(0)),
        }
        .map_err(db_err("Failed to count checkpoints"))?;
        Ok(n as usize)
    }
}

impl CheckpointSink for CheckpointStore {
    fn save(
        &self,
        session_id: &str,
        data: &serde_json::Value,
        metadata: Option<&serde_json::Value>,
    ) -> Result<String> {
        let checkpoint_id = uuid::Uuid::new_v4().to_string();
        let data = serde_json::to_string(data)?;
        let metadata = metadata.map(serde_json::to_string).transpose()?;

        self.conn()
            .execute(
                "INSERT INTO checkpoints (checkpoint_id, session_id, timestamp, data, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![checkpoint_id, session_id, ts(self.clock.now()), data, metadata],
            )
            .map_err(db_err("Failed to save checkpoint"))?;

        debug!(session_id, checkpoint_id = %checkpoint_id, "Checkpoint saved");
        Ok(checkpoint_id)
    }

    fn load_latest(&self, session_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .query(
                &format!(
                    "SELECT {} FROM checkpoints WHERE session_id = ?1
                     ORDER BY timestamp DESC, seq DESC LIMIT 1",
                    COLUMNS
                ),
                &[&session_id],
            )?
            .into_iter()
            .next())
    }

    fn load_all(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        self.query(
            &format!(
                "SELECT {} FROM checkpoints WHERE session_id = ?1
                 ORDER BY timestamp DESC, seq DESC",
                COLUMNS
            ),
            &[&session_id],
        )
    }
}
