// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Sync history storage using SQLite.

use anyhow::Result;
use chrono::{DateTime, Local, TimeZone};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::events::{ClockAdjustment, SourceKind, SyncOutcome};

/// A single recorded sync attempt.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub id: i64,
    pub timestamp: DateTime<Local>,
    pub source: SourceKind,
    pub outcome: SyncOutcome,
}

/// Sync history database.
#[derive(Clone)]
pub struct SyncHistory {
    conn: Arc<Mutex<Connection>>,
    max_entries: u32,
}

const SELECT_COLUMNS: &str = "SELECT id, timestamp, source, outcome, drift_ms, applied, detail FROM sync_history";

impl SyncHistory {
    /// Create or open the history database in `data_dir`.
    pub fn new(data_dir: &Path, max_entries: u32) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("sync_history.db");
        info!("Opening sync history database: {:?}", db_path);

        let conn = Connection::open(&db_path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp INTEGER NOT NULL,
                source TEXT NOT NULL,
                outcome TEXT NOT NULL,
                drift_ms INTEGER,
                applied INTEGER NOT NULL DEFAULT 0,
                detail TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sync_source ON sync_history(source, id DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_entries,
        })
    }

    /// Record the outcome of a sync attempt.
    pub fn record(&self, source: SourceKind, outcome: &SyncOutcome) -> Result<()> {
        let conn = self.conn.lock();
        let timestamp = Local::now().timestamp_millis();

        let (kind, drift_ms, applied, detail) = match outcome {
            SyncOutcome::Success(adj) => ("SUCCESS", Some(adj.drift_ms), adj.applied, None),
            SyncOutcome::Failure(reason) => ("FAILURE", None, false, Some(reason.as_str())),
        };

        conn.execute(
            "INSERT INTO sync_history (timestamp, source, outcome, drift_ms, applied, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![timestamp, source.as_str(), kind, drift_ms, applied, detail],
        )?;
        debug!("Recorded {} {} in history", source.as_str(), kind);

        self.cleanup_old_entries(&conn)?;

        Ok(())
    }

    /// Most recent entries, newest first.
    pub fn get_recent(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} ORDER BY id DESC LIMIT ?1", SELECT_COLUMNS))?;

        let entries = stmt
            .query_map([limit], row_to_entry)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Latest successful sync from `source`.
    pub fn last_success(&self, source: SourceKind) -> Result<Option<HistoryEntry>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "{} WHERE source = ?1 AND outcome = 'SUCCESS' ORDER BY id DESC LIMIT 1",
                    SELECT_COLUMNS
                ),
                [source.as_str()],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Clear all history.
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM sync_history", [])?;
        info!("Sync history cleared");
        Ok(())
    }

    /// Get total entry count.
    pub fn count(&self) -> Result<u32> {
        let conn = self.conn.lock();
        let count: u32 =
            conn.query_row("SELECT COUNT(*) FROM sync_history", [], |row| row.get(0))?;
        Ok(count)
    }

    fn cleanup_old_entries(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "DELETE FROM sync_history WHERE id NOT IN (
                SELECT id FROM sync_history ORDER BY id DESC LIMIT ?1
            )",
            [self.max_entries],
        )?;
        Ok(())
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let timestamp_ms: i64 = row.get(1)?;
    let source_str: String = row.get(2)?;
    let outcome_str: String = row.get(3)?;

    let timestamp = Local
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(1, "timestamp".into(), Type::Integer))?;
    let source = SourceKind::parse(&source_str)
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(2, "source".into(), Type::Text))?;

    let outcome = match outcome_str.as_str() {
        "SUCCESS" => SyncOutcome::Success(ClockAdjustment {
            drift_ms: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
            applied: row.get(5)?,
        }),
        _ => SyncOutcome::Failure(row.get::<_, Option<String>>(6)?.unwrap_or_default()),
    };

    Ok(HistoryEntry {
        id: row.get(0)?,
        timestamp,
        source,
        outcome,
    })
}
