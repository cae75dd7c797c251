use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::StoreError;

use super::{now_ms, to_i64, to_u64};

const DEFAULT_DB_PATH: &str = "leaderboard.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub address: String,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct LeaderboardSnapshot {
    pub period: String,
    pub entries: Vec<LeaderboardEntry>,
    pub last_processed_index: usize,
    pub processing_complete: bool,
    pub last_processed_at_ms: u64,
}

impl LeaderboardSnapshot {
    pub fn remaining(&self) -> usize {
        self.entries.len().saturating_sub(self.last_processed_index)
    }
}

/// Snapshot store for settlement periods. Entries are persisted as one JSON
/// array per period so the stored order survives verbatim; that order is the
/// tie-break authority for equal scores.
#[derive(Debug, Clone)]
pub struct LeaderboardDb {
    path: PathBuf,
}

impl LeaderboardDb {
    pub fn open_default() -> anyhow::Result<Self> {
        Self::open(DEFAULT_DB_PATH)
    }

    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let db = Self {
            path: path.as_ref().to_path_buf(),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> anyhow::Result<()> {
        self.with_connection("ensure_schema", |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS leaderboard_snapshots (
                    period TEXT PRIMARY KEY,
                    entries_json TEXT NOT NULL,
                    last_processed_index INTEGER NOT NULL DEFAULT 0,
                    processing_complete INTEGER NOT NULL DEFAULT 0,
                    last_processed_at_ms INTEGER NOT NULL DEFAULT 0,
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL
                );
                "#,
            )?;
            let _ = conn.execute_batch(
                r#"
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                "#,
            );
            Ok(())
        })
    }

    /// Seeds (or replaces) the snapshot for a period and resets its cursor.
    /// Entry addresses must be unique and scores finite; the stored array
    /// order is preserved exactly as given.
    pub fn put_snapshot(&self, period: &str, entries: &[LeaderboardEntry]) -> anyhow::Result<()> {
        let period = period.trim();
        if period.is_empty() {
            return Err(StoreError::InvalidSnapshot {
                period: period.to_string(),
                reason: "empty period id".to_string(),
            }
            .into());
        }
        let mut seen = HashSet::new();
        for entry in entries {
            if entry.address.trim().is_empty() {
                return Err(StoreError::InvalidSnapshot {
                    period: period.to_string(),
                    reason: "entry with empty address".to_string(),
                }
                .into());
            }
            if !seen.insert(entry.address.as_str()) {
                return Err(StoreError::InvalidSnapshot {
                    period: period.to_string(),
                    reason: format!("duplicate address {}", entry.address),
                }
                .into());
            }
            if !entry.score.is_finite() {
                return Err(StoreError::InvalidSnapshot {
                    period: period.to_string(),
                    reason: format!("non-finite score for {}", entry.address),
                }
                .into());
            }
        }

        let entries_json = serde_json::to_string(entries)?;
        let now = to_i64(now_ms());
        self.with_connection("put_snapshot", |conn| {
            conn.execute(
                r#"
                INSERT INTO leaderboard_snapshots (
                    period, entries_json, last_processed_index, processing_complete,
                    last_processed_at_ms, created_at_ms, updated_at_ms
                )
                VALUES (?1, ?2, 0, 0, 0, ?3, ?3)
                ON CONFLICT(period) DO UPDATE SET
                    entries_json = excluded.entries_json,
                    last_processed_index = 0,
                    processing_complete = 0,
                    last_processed_at_ms = 0,
                    updated_at_ms = excluded.updated_at_ms
                "#,
                params![period, entries_json, now],
            )
        })
        .map(|_| ())
    }

    pub fn snapshot(&self, period: &str) -> anyhow::Result<Option<LeaderboardSnapshot>> {
        let period = period.trim().to_string();
        self.with_connection("snapshot", |conn| {
            conn.query_row(
                "SELECT entries_json, last_processed_index, processing_complete, \
                 last_processed_at_ms FROM leaderboard_snapshots WHERE period = ?1",
                params![period],
                |row| {
                    let entries_json: String = row.get(0)?;
                    let entries: Vec<LeaderboardEntry> = serde_json::from_str(&entries_json)
                        .map_err(|err| {
                            rusqlite::Error::FromSqlConversionFailure(
                                0,
                                rusqlite::types::Type::Text,
                                Box::new(err),
                            )
                        })?;
                    Ok(LeaderboardSnapshot {
                        period: period.clone(),
                        entries,
                        last_processed_index: to_u64(row.get::<_, i64>(1)?) as usize,
                        processing_complete: row.get::<_, i64>(2)? != 0,
                        last_processed_at_ms: to_u64(row.get::<_, i64>(3)?),
                    })
                },
            )
            .optional()
        })
    }

    /// Compare-and-set cursor advance. Succeeds only when the stored cursor
    /// still equals `expected_index`; returns false when another invocation
    /// advanced it first, in which case the caller must re-read.
    pub fn advance_cursor(
        &self,
        period: &str,
        expected_index: usize,
        new_index: usize,
        processing_complete: bool,
        now_ms_value: u64,
    ) -> anyhow::Result<bool> {
        let now = to_i64(now_ms_value);
        self.with_connection("advance_cursor", |conn| {
            conn.execute(
                r#"
                UPDATE leaderboard_snapshots
                SET last_processed_index = ?3, processing_complete = ?4,
                    last_processed_at_ms = ?5, updated_at_ms = ?5
                WHERE period = ?1 AND last_processed_index = ?2
                "#,
                params![
                    period.trim(),
                    to_i64(expected_index as u64),
                    to_i64(new_index as u64),
                    processing_complete as i64,
                    now
                ],
            )
        })
        .map(|changed| changed == 1)
    }

    fn with_connection<T, F>(&self, context: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        super::with_connection(&self.path, context, op)
    }
}
