use anyhow::Context;
use rusqlite::ffi::ErrorCode;
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod leaderboard_db;
pub mod records_db;

pub use leaderboard_db::{LeaderboardDb, LeaderboardEntry, LeaderboardSnapshot};
pub use records_db::{
    task_record_key, Asset, NewTask, PointLedgerEntry, RecordsDb, SweepOutcome, TaskAction,
    TaskRecord, TaskStatus, TaskStatusCounts,
};

static LAST_STORAGE_NOW_MS: AtomicU64 = AtomicU64::new(1);

/// Runs one store operation against a fresh connection, retrying a handful of
/// times when sqlite reports the database as locked or busy. Connections are
/// opened per call; WAL mode keeps that cheap and avoids holding a handle
/// across await points in the callers.
pub(crate) fn with_connection<T, F>(path: &Path, context: &str, op: F) -> anyhow::Result<T>
where
    F: Fn(&Connection) -> rusqlite::Result<T>,
{
    let max_attempts = 6u32;
    let mut last_err = String::new();

    for attempt in 1..=max_attempts {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database {}", path.display()))?;
        conn.busy_timeout(Duration::from_millis(5_000))
            .context("failed to configure sqlite busy timeout")?;

        match op(&conn) {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = err.to_string();
                if is_sqlite_locked_error(&err) && attempt < max_attempts {
                    continue;
                }
                return Err(anyhow::anyhow!(
                    "{} failed for {}: {}",
                    context,
                    path.display(),
                    last_err
                ));
            }
        }
    }

    Err(anyhow::anyhow!(
        "{} failed for {} after {} attempt(s): {}",
        context,
        path.display(),
        max_attempts,
        last_err
    ))
}

pub(crate) fn is_sqlite_locked_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            )
        }
        _ => {
            let msg = err.to_string().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Wall clock in unix milliseconds, normalized so repeated calls never move
/// backwards within this process.
pub fn now_ms() -> u64 {
    let sample = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|duration| duration.as_millis() as u64);
    normalize_storage_now_ms(sample)
}

fn normalize_storage_now_ms(sample_ms: Option<u64>) -> u64 {
    let mut prev = LAST_STORAGE_NOW_MS.load(Ordering::Relaxed);
    loop {
        let normalized = sample_ms.unwrap_or(prev).max(prev).max(1);
        match LAST_STORAGE_NOW_MS.compare_exchange_weak(
            prev,
            normalized,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return normalized,
            Err(actual) => prev = actual,
        }
    }
}

pub(crate) fn to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

pub(crate) fn to_u64(value: i64) -> u64 {
    if value < 0 {
        0
    } else {
        value as u64
    }
}

pub(crate) fn to_u32(value: i64) -> u32 {
    if value < 0 {
        0
    } else if value > u32::MAX as i64 {
        u32::MAX
    } else {
        value as u32
    }
}
