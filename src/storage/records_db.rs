use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use super::{now_ms, to_i64, to_u32, to_u64};

const DEFAULT_DB_PATH: &str = "records.db";

/// Record-key prefix that separates live execution state from settled history
/// inside the shared per-user keyspace. Point ledger rows use the bare period
/// date as their record key and never collide with this prefix.
pub const TASK_RECORD_PREFIX: &str = "EXEC_TASK_";

const CLAIM_SCAN_ATTEMPTS: usize = 4;
const STALE_CLAIM_ERROR: &str = "execution claim exceeded liveness timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Executing,
    Confirmed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Executing => "EXECUTING",
            TaskStatus::Confirmed => "CONFIRMED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "EXECUTING" => Some(Self::Executing),
            "CONFIRMED" => Some(Self::Confirmed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Confirmed | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskAction {
    Supply,
    Withdraw,
    Borrow,
    Repay,
}

impl TaskAction {
    pub const ALLOWED: &'static str = "supply, withdraw, borrow, repay";

    pub fn as_str(self) -> &'static str {
        match self {
            TaskAction::Supply => "supply",
            TaskAction::Withdraw => "withdraw",
            TaskAction::Borrow => "borrow",
            TaskAction::Repay => "repay",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "supply" => Some(Self::Supply),
            "withdraw" => Some(Self::Withdraw),
            "borrow" => Some(Self::Borrow),
            "repay" => Some(Self::Repay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Asset {
    Usdt,
    Mbx,
    Bora,
    Six,
    Kaia,
}

impl Asset {
    pub const ALLOWED: &'static str = "USDT, MBX, BORA, SIX, KAIA";

    pub fn as_str(self) -> &'static str {
        match self {
            Asset::Usdt => "USDT",
            Asset::Mbx => "MBX",
            Asset::Bora => "BORA",
            Asset::Six => "SIX",
            Asset::Kaia => "KAIA",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "USDT" => Some(Self::Usdt),
            "MBX" => Some(Self::Mbx),
            "BORA" => Some(Self::Bora),
            "SIX" => Some(Self::Six),
            "KAIA" => Some(Self::Kaia),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStatusCounts {
    pub pending: u64,
    pub executing: u64,
    pub confirmed: u64,
    pub failed: u64,
}

impl TaskStatusCounts {
    pub fn total(self) -> u64 {
        self.pending
            .saturating_add(self.executing)
            .saturating_add(self.confirmed)
            .saturating_add(self.failed)
    }
}

/// Fields supplied by the submission service for the single atomic create.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: String,
    pub user_address: String,
    pub action: TaskAction,
    pub asset: Asset,
    pub amount: String,
    pub max_gas_price: String,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub user_address: String,
    pub record_key: String,
    pub task_id: String,
    pub action: TaskAction,
    pub asset: Asset,
    pub amount: String,
    pub max_gas_price: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub claim_seq: i64,
    pub not_before_ms: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub tx_hash: Option<String>,
    pub gas_used: Option<u64>,
    pub block_number: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PointLedgerEntry {
    pub user_address: String,
    pub period: String,
    pub reward_amount: f64,
    pub status: String,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub requeued: u64,
    pub failed: u64,
}

pub fn task_record_key(task_id: &str) -> String {
    format!("{TASK_RECORD_PREFIX}{task_id}")
}

#[derive(Debug, Clone)]
pub struct RecordsDb {
    path: PathBuf,
}

impl RecordsDb {
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
                CREATE TABLE IF NOT EXISTS user_records (
                    user_address TEXT NOT NULL,
                    record_key TEXT NOT NULL,
                    task_id TEXT,
                    action TEXT,
                    asset TEXT,
                    amount TEXT,
                    max_gas_price TEXT,
                    status TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    max_retries INTEGER NOT NULL DEFAULT 3,
                    claim_seq INTEGER NOT NULL DEFAULT 0,
                    not_before_ms INTEGER NOT NULL DEFAULT 0,
                    points REAL,
                    created_at_ms INTEGER NOT NULL,
                    updated_at_ms INTEGER NOT NULL,
                    tx_hash TEXT,
                    gas_used INTEGER,
                    block_number INTEGER,
                    last_error TEXT,
                    PRIMARY KEY (user_address, record_key)
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_user_records_task_id
                    ON user_records(task_id) WHERE task_id IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_user_records_status_created
                    ON user_records(status, created_at_ms);
                CREATE INDEX IF NOT EXISTS idx_user_records_user_created
                    ON user_records(user_address, created_at_ms);
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

    /// Single atomic create of a PENDING task. The unique index on `task_id`
    /// makes a duplicate request id an insert error rather than a silent
    /// overwrite.
    pub fn insert_pending_task(&self, new_task: &NewTask) -> anyhow::Result<TaskRecord> {
        let now = now_ms();
        let record_key = task_record_key(&new_task.task_id);
        self.with_connection("insert_pending_task", |conn| {
            conn.execute(
                r#"
                INSERT INTO user_records (
                    user_address, record_key, task_id, action, asset, amount,
                    max_gas_price, status, retry_count, max_retries, claim_seq,
                    not_before_ms, created_at_ms, updated_at_ms
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', 0, ?8, 0, 0, ?9, ?9)
                "#,
                params![
                    new_task.user_address,
                    record_key,
                    new_task.task_id,
                    new_task.action.as_str(),
                    new_task.asset.as_str(),
                    new_task.amount,
                    new_task.max_gas_price,
                    i64::from(new_task.max_retries),
                    to_i64(now),
                ],
            )
        })?;
        Ok(TaskRecord {
            user_address: new_task.user_address.clone(),
            record_key: task_record_key(&new_task.task_id),
            task_id: new_task.task_id.clone(),
            action: new_task.action,
            asset: new_task.asset,
            amount: new_task.amount.clone(),
            max_gas_price: new_task.max_gas_price.clone(),
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: new_task.max_retries,
            claim_seq: 0,
            not_before_ms: 0,
            created_at_ms: now,
            updated_at_ms: now,
            tx_hash: None,
            gas_used: None,
            block_number: None,
            last_error: None,
        })
    }

    pub fn task_by_id(&self, task_id: &str) -> anyhow::Result<Option<TaskRecord>> {
        self.with_connection("task_by_id", |conn| {
            conn.query_row(
                &format!("{TASK_SELECT} WHERE task_id = ?1 LIMIT 1"),
                params![task_id],
                task_record_from_row,
            )
            .optional()
        })
    }

    /// Claims the oldest eligible PENDING task: the PENDING→EXECUTING
    /// transition is conditional on both the status and the claim sequence
    /// observed during the scan, so two workers can never hold the same task.
    /// A lost race re-scans with a fresh read; it is never an error.
    pub fn claim_next_pending(&self, now_ms_value: u64) -> anyhow::Result<Option<TaskRecord>> {
        let now = to_i64(now_ms_value);
        self.with_connection("claim_next_pending", |conn| {
            for _ in 0..CLAIM_SCAN_ATTEMPTS {
                let candidate = conn
                    .query_row(
                        &format!(
                            "{TASK_SELECT} WHERE record_key LIKE 'EXEC_%' \
                             AND status = 'PENDING' AND not_before_ms <= ?1 \
                             ORDER BY created_at_ms ASC, rowid ASC LIMIT 1"
                        ),
                        params![now],
                        task_record_from_row,
                    )
                    .optional()?;
                let Some(task) = candidate else {
                    return Ok(None);
                };
                let claimed = conn.execute(
                    r#"
                    UPDATE user_records
                    SET status = 'EXECUTING', claim_seq = claim_seq + 1, updated_at_ms = ?3
                    WHERE user_address = ?1 AND record_key = ?2
                      AND status = 'PENDING' AND claim_seq = ?4
                    "#,
                    params![task.user_address, task.record_key, now, task.claim_seq],
                )?;
                if claimed == 1 {
                    let mut claimed_task = task;
                    claimed_task.status = TaskStatus::Executing;
                    claimed_task.claim_seq += 1;
                    claimed_task.updated_at_ms = now_ms_value;
                    return Ok(Some(claimed_task));
                }
                tracing::debug!(
                    "[CLAIM] Lost claim race for {}; rescanning with a fresh read",
                    task.task_id
                );
            }
            Ok(None)
        })
    }

    /// EXECUTING→CONFIRMED, fenced by the claim sequence. Returns false when
    /// the claim was lost in the meantime (swept and possibly re-claimed).
    pub fn confirm_task(
        &self,
        task_id: &str,
        claim_seq: i64,
        tx_hash: &str,
        gas_used: u64,
        block_number: u64,
    ) -> anyhow::Result<bool> {
        let now = to_i64(now_ms());
        self.with_connection("confirm_task", |conn| {
            conn.execute(
                r#"
                UPDATE user_records
                SET status = 'CONFIRMED', tx_hash = ?3, gas_used = ?4,
                    block_number = ?5, last_error = NULL, updated_at_ms = ?6
                WHERE task_id = ?1 AND status = 'EXECUTING' AND claim_seq = ?2
                "#,
                params![
                    task_id,
                    claim_seq,
                    tx_hash,
                    to_i64(gas_used),
                    to_i64(block_number),
                    now
                ],
            )
        })
        .map(|changed| changed == 1)
    }

    /// EXECUTING→PENDING after a transient failure, with the caller-computed
    /// retry count and re-eligibility time. Fenced like `confirm_task`.
    pub fn requeue_task(
        &self,
        task_id: &str,
        claim_seq: i64,
        retry_count: u32,
        not_before_ms: u64,
        error: &str,
    ) -> anyhow::Result<bool> {
        let now = to_i64(now_ms());
        self.with_connection("requeue_task", |conn| {
            conn.execute(
                r#"
                UPDATE user_records
                SET status = 'PENDING', retry_count = ?3, not_before_ms = ?4,
                    last_error = ?5, updated_at_ms = ?6
                WHERE task_id = ?1 AND status = 'EXECUTING' AND claim_seq = ?2
                "#,
                params![
                    task_id,
                    claim_seq,
                    i64::from(retry_count),
                    to_i64(not_before_ms),
                    error,
                    now
                ],
            )
        })
        .map(|changed| changed == 1)
    }

    /// EXECUTING→FAILED, fenced like `confirm_task`.
    pub fn fail_task(
        &self,
        task_id: &str,
        claim_seq: i64,
        retry_count: u32,
        error: &str,
    ) -> anyhow::Result<bool> {
        let now = to_i64(now_ms());
        self.with_connection("fail_task", |conn| {
            conn.execute(
                r#"
                UPDATE user_records
                SET status = 'FAILED', retry_count = ?3, last_error = ?4, updated_at_ms = ?5
                WHERE task_id = ?1 AND status = 'EXECUTING' AND claim_seq = ?2
                "#,
                params![task_id, claim_seq, i64::from(retry_count), error, now],
            )
        })
        .map(|changed| changed == 1)
    }

    /// Returns tasks stuck in EXECUTING past the liveness timeout to PENDING
    /// (or FAILED once the retry budget is exhausted), through the same
    /// fenced conditional updates the worker uses. A task whose worker
    /// finishes between the scan and the update simply no-ops here.
    pub fn sweep_stale_executing(
        &self,
        now_ms_value: u64,
        liveness_timeout_ms: u64,
    ) -> anyhow::Result<SweepOutcome> {
        let cutoff = to_i64(now_ms_value.saturating_sub(liveness_timeout_ms));
        let now = to_i64(now_ms_value);
        self.with_connection("sweep_stale_executing", |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, claim_seq, retry_count, max_retries FROM user_records \
                 WHERE record_key LIKE 'EXEC_%' AND status = 'EXECUTING' AND updated_at_ms < ?1",
            )?;
            let stale = stmt
                .query_map(params![cutoff], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut outcome = SweepOutcome::default();
            for (task_id, claim_seq, retry_count, max_retries) in stale {
                let next = retry_count.saturating_add(1);
                if next >= max_retries {
                    let changed = conn.execute(
                        r#"
                        UPDATE user_records
                        SET status = 'FAILED', retry_count = ?3, last_error = ?4, updated_at_ms = ?5
                        WHERE task_id = ?1 AND status = 'EXECUTING' AND claim_seq = ?2
                          AND updated_at_ms < ?6
                        "#,
                        params![task_id, claim_seq, next, STALE_CLAIM_ERROR, now, cutoff],
                    )?;
                    outcome.failed += changed as u64;
                } else {
                    let changed = conn.execute(
                        r#"
                        UPDATE user_records
                        SET status = 'PENDING', retry_count = ?3, not_before_ms = ?5,
                            last_error = ?4, updated_at_ms = ?5
                        WHERE task_id = ?1 AND status = 'EXECUTING' AND claim_seq = ?2
                          AND updated_at_ms < ?6
                        "#,
                        params![task_id, claim_seq, next, STALE_CLAIM_ERROR, now, cutoff],
                    )?;
                    outcome.requeued += changed as u64;
                }
            }
            Ok(outcome)
        })
    }

    pub fn task_status_counts(&self) -> anyhow::Result<TaskStatusCounts> {
        self.with_connection("task_status_counts", |conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM user_records \
                 WHERE record_key LIKE 'EXEC_%' GROUP BY status",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut counts = TaskStatusCounts::default();
            for row in rows {
                let (status_raw, count_raw) = row?;
                let count = if count_raw <= 0 { 0 } else { count_raw as u64 };
                match TaskStatus::from_db(status_raw.trim()) {
                    Some(TaskStatus::Pending) => counts.pending = count,
                    Some(TaskStatus::Executing) => counts.executing = count,
                    Some(TaskStatus::Confirmed) => counts.confirmed = count,
                    Some(TaskStatus::Failed) => counts.failed = count,
                    None => {}
                }
            }
            Ok(counts)
        })
    }

    /// Recent execution records for one user, newest first. The `EXEC_` key
    /// prefix keeps point ledger rows out of this range scan.
    pub fn user_task_history(
        &self,
        user_address: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<TaskRecord>> {
        let limit = limit.clamp(1, 500) as i64;
        self.with_connection("user_task_history", |conn| {
            let mut stmt = conn.prepare(&format!(
                "{TASK_SELECT} WHERE user_address = ?1 AND record_key LIKE 'EXEC_%' \
                 ORDER BY created_at_ms DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![user_address, limit], task_record_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Idempotent overwrite keyed (`user_address`, period). Re-running a
    /// settlement batch rewrites the same rows with the same values.
    pub fn upsert_point_entry(
        &self,
        user_address: &str,
        period: &str,
        reward_amount: f64,
    ) -> anyhow::Result<()> {
        let now = to_i64(now_ms());
        self.with_connection("upsert_point_entry", |conn| {
            conn.execute(
                r#"
                INSERT INTO user_records (user_address, record_key, status, points, created_at_ms, updated_at_ms)
                VALUES (?1, ?2, 'active', ?3, ?4, ?4)
                ON CONFLICT(user_address, record_key) DO UPDATE SET
                    points = excluded.points,
                    status = excluded.status,
                    updated_at_ms = excluded.updated_at_ms
                "#,
                params![user_address, period, reward_amount, now],
            )
        })
        .map(|_| ())
    }

    pub fn point_entry(
        &self,
        user_address: &str,
        period: &str,
    ) -> anyhow::Result<Option<PointLedgerEntry>> {
        self.with_connection("point_entry", |conn| {
            conn.query_row(
                "SELECT points, status, updated_at_ms FROM user_records \
                 WHERE user_address = ?1 AND record_key = ?2 LIMIT 1",
                params![user_address, period],
                |row| {
                    Ok(PointLedgerEntry {
                        user_address: user_address.to_string(),
                        period: period.to_string(),
                        reward_amount: row.get::<_, Option<f64>>(0)?.unwrap_or(0.0),
                        status: row.get::<_, String>(1)?,
                        updated_at_ms: to_u64(row.get::<_, i64>(2)?),
                    })
                },
            )
            .optional()
        })
    }

    pub fn point_entries_for_period(&self, period: &str) -> anyhow::Result<Vec<PointLedgerEntry>> {
        self.with_connection("point_entries_for_period", |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_address, points, status, updated_at_ms FROM user_records \
                 WHERE record_key = ?1 ORDER BY user_address ASC",
            )?;
            let rows = stmt.query_map(params![period], |row| {
                Ok(PointLedgerEntry {
                    user_address: row.get::<_, String>(0)?,
                    period: period.to_string(),
                    reward_amount: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                    status: row.get::<_, String>(2)?,
                    updated_at_ms: to_u64(row.get::<_, i64>(3)?),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Retention sweep over terminal task records. Live tasks and the point
    /// ledger are never touched.
    pub fn purge_terminal_tasks_before(&self, cutoff_ms: u64) -> anyhow::Result<u64> {
        let cutoff = to_i64(cutoff_ms);
        self.with_connection("purge_terminal_tasks_before", |conn| {
            conn.execute(
                "DELETE FROM user_records WHERE record_key LIKE 'EXEC_%' \
                 AND status IN ('CONFIRMED', 'FAILED') AND updated_at_ms < ?1",
                params![cutoff],
            )
        })
        .map(|deleted| deleted as u64)
    }

    fn with_connection<T, F>(&self, context: &str, op: F) -> anyhow::Result<T>
    where
        F: Fn(&Connection) -> rusqlite::Result<T>,
    {
        super::with_connection(&self.path, context, op)
    }
}

const TASK_SELECT: &str = "SELECT user_address, record_key, task_id, action, asset, amount, \
     max_gas_price, status, retry_count, max_retries, claim_seq, not_before_ms, \
     created_at_ms, updated_at_ms, tx_hash, gas_used, block_number, last_error \
     FROM user_records";

fn task_record_from_row(row: &rusqlite::Row) -> rusqlite::Result<TaskRecord> {
    let action_raw: String = row.get(3)?;
    let asset_raw: String = row.get(4)?;
    let status_raw: String = row.get(7)?;
    let action = TaskAction::parse(action_raw.trim()).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown action `{action_raw}`").into(),
        )
    })?;
    let asset = Asset::parse(asset_raw.trim()).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown asset `{asset_raw}`").into(),
        )
    })?;
    let status = TaskStatus::from_db(status_raw.trim()).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            7,
            rusqlite::types::Type::Text,
            format!("unknown task status `{status_raw}`").into(),
        )
    })?;
    Ok(TaskRecord {
        user_address: row.get(0)?,
        record_key: row.get(1)?,
        task_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        action,
        asset,
        amount: row.get(5)?,
        max_gas_price: row.get(6)?,
        status,
        retry_count: to_u32(row.get::<_, i64>(8)?),
        max_retries: to_u32(row.get::<_, i64>(9)?),
        claim_seq: row.get(10)?,
        not_before_ms: to_u64(row.get::<_, i64>(11)?),
        created_at_ms: to_u64(row.get::<_, i64>(12)?),
        updated_at_ms: to_u64(row.get::<_, i64>(13)?),
        tx_hash: row.get(14)?,
        gas_used: row.get::<_, Option<i64>>(15)?.map(to_u64),
        block_number: row.get::<_, Option<i64>>(16)?.map(to_u64),
        last_error: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{}_{}.db", prefix, nanos))
    }

    fn sample_task(user: &str, id: &str) -> NewTask {
        NewTask {
            task_id: id.to_string(),
            user_address: user.to_string(),
            action: TaskAction::Supply,
            asset: Asset::Usdt,
            amount: "100.5".to_string(),
            max_gas_price: "50".to_string(),
            max_retries: 3,
        }
    }

    #[test]
    fn test_task_lifecycle_insert_claim_confirm() {
        let path = temp_db_path("records_db_lifecycle");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x1111111111111111111111111111111111111111";

        let created = db
            .insert_pending_task(&sample_task(user, "task_aaaa"))
            .expect("insert");
        assert_eq!(created.status, TaskStatus::Pending);
        assert_eq!(created.retry_count, 0);
        assert_eq!(created.record_key, "EXEC_TASK_task_aaaa");

        let claimed = db
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("one pending task");
        assert_eq!(claimed.task_id, "task_aaaa");
        assert_eq!(claimed.status, TaskStatus::Executing);
        assert_eq!(claimed.claim_seq, 1);

        assert!(db
            .confirm_task("task_aaaa", claimed.claim_seq, "0xdead", 21_000, 42)
            .expect("confirm"));
        let stored = db
            .task_by_id("task_aaaa")
            .expect("lookup")
            .expect("task exists");
        assert_eq!(stored.status, TaskStatus::Confirmed);
        assert_eq!(stored.tx_hash.as_deref(), Some("0xdead"));
        assert_eq!(stored.gas_used, Some(21_000));
        assert_eq!(stored.block_number, Some(42));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_claim_orders_oldest_first() {
        let path = temp_db_path("records_db_order");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x2222222222222222222222222222222222222222";
        db.insert_pending_task(&sample_task(user, "task_first"))
            .expect("insert first");
        db.insert_pending_task(&sample_task(user, "task_second"))
            .expect("insert second");

        let first = db
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("first claim");
        let second = db
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("second claim");
        assert_eq!(first.task_id, "task_first");
        assert_eq!(second.task_id, "task_second");
        assert!(db.claim_next_pending(now_ms()).expect("claim").is_none());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_claim_mutual_exclusion_under_contention() {
        let path = temp_db_path("records_db_exclusive");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x3333333333333333333333333333333333333333";
        db.insert_pending_task(&sample_task(user, "task_contested"))
            .expect("insert");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let worker_db = db.clone();
            handles.push(std::thread::spawn(move || {
                worker_db
                    .claim_next_pending(now_ms())
                    .expect("claim attempt")
                    .is_some()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().expect("thread join"))
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);

        let stored = db
            .task_by_id("task_contested")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Executing);
        assert_eq!(stored.claim_seq, 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_stale_claim_seq_cannot_complete() {
        let path = temp_db_path("records_db_fence");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x4444444444444444444444444444444444444444";
        db.insert_pending_task(&sample_task(user, "task_fenced"))
            .expect("insert");

        let claimed = db
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("claimed");
        assert!(db
            .requeue_task("task_fenced", claimed.claim_seq, 1, 0, "boom")
            .expect("requeue"));

        // The original claim holder lost ownership after the requeue.
        assert!(!db
            .confirm_task("task_fenced", claimed.claim_seq, "0xbeef", 1, 1)
            .expect("confirm with stale fence"));

        let reclaimed = db
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("reclaimed");
        assert_eq!(reclaimed.claim_seq, 2);
        assert_eq!(reclaimed.retry_count, 1);

        // The first claim's fence no longer matches the second claim.
        assert!(!db
            .confirm_task("task_fenced", claimed.claim_seq, "0xbeef", 1, 1)
            .expect("confirm with old fence"));
        assert!(db
            .confirm_task("task_fenced", reclaimed.claim_seq, "0xbeef", 1, 1)
            .expect("confirm with current fence"));

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_not_before_gates_claim_eligibility() {
        let path = temp_db_path("records_db_backoff");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x5555555555555555555555555555555555555555";
        db.insert_pending_task(&sample_task(user, "task_delayed"))
            .expect("insert");

        let now = now_ms();
        let claimed = db
            .claim_next_pending(now)
            .expect("claim")
            .expect("claimed");
        assert!(db
            .requeue_task(
                "task_delayed",
                claimed.claim_seq,
                1,
                now + 60_000,
                "transient"
            )
            .expect("requeue"));

        assert!(db.claim_next_pending(now).expect("claim").is_none());
        assert!(db
            .claim_next_pending(now + 61_000)
            .expect("claim")
            .is_some());

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_sweep_requeues_stale_and_fails_exhausted() {
        let path = temp_db_path("records_db_sweep");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x6666666666666666666666666666666666666666";
        db.insert_pending_task(&sample_task(user, "task_fresh"))
            .expect("insert fresh");
        db.insert_pending_task(&sample_task(user, "task_spent"))
            .expect("insert spent");

        let now = now_ms();
        // Burn the retry budget of task_spent down to its final claim.
        for retry in 1..3u32 {
            let claimed = db.claim_next_pending(now).expect("claim").expect("claimed");
            let (a, b) = if claimed.task_id == "task_spent" {
                (claimed, db.claim_next_pending(now).expect("claim"))
            } else {
                (
                    db.claim_next_pending(now)
                        .expect("claim")
                        .expect("other claim"),
                    Some(claimed),
                )
            };
            assert!(db
                .requeue_task("task_spent", a.claim_seq, retry, 0, "transient")
                .expect("requeue spent"));
            if let Some(fresh) = b {
                assert!(db
                    .requeue_task("task_fresh", fresh.claim_seq, 0, 0, "reset")
                    .expect("requeue fresh"));
            }
        }

        // Leave both EXECUTING, then sweep from far enough in the future that
        // both claims exceed the liveness timeout.
        let first = db.claim_next_pending(now).expect("claim").expect("first");
        let second = db.claim_next_pending(now).expect("claim").expect("second");
        assert_ne!(first.task_id, second.task_id);

        let outcome = db
            .sweep_stale_executing(now + 400_000, 300_000)
            .expect("sweep");
        assert_eq!(outcome.requeued + outcome.failed, 2);
        assert_eq!(outcome.failed, 1);

        let spent = db
            .task_by_id("task_spent")
            .expect("lookup")
            .expect("exists");
        assert_eq!(spent.status, TaskStatus::Failed);
        assert_eq!(spent.retry_count, spent.max_retries);
        assert_eq!(spent.last_error.as_deref(), Some(STALE_CLAIM_ERROR));

        let fresh = db
            .task_by_id("task_fresh")
            .expect("lookup")
            .expect("exists");
        assert_eq!(fresh.status, TaskStatus::Pending);
        assert_eq!(fresh.retry_count, 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_point_ledger_overwrite_is_idempotent() {
        let path = temp_db_path("records_db_ledger");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x7777777777777777777777777777777777777777";

        db.upsert_point_entry(user, "2024-01-01", 10.5)
            .expect("first write");
        db.upsert_point_entry(user, "2024-01-01", 10.5)
            .expect("repeat write");
        let entry = db
            .point_entry(user, "2024-01-01")
            .expect("read")
            .expect("entry exists");
        assert_eq!(entry.reward_amount, 10.5);
        assert_eq!(entry.status, "active");

        db.upsert_point_entry(user, "2024-01-01", 12.0)
            .expect("overwrite");
        let entry = db
            .point_entry(user, "2024-01-01")
            .expect("read")
            .expect("entry exists");
        assert_eq!(entry.reward_amount, 12.0);

        let all = db
            .point_entries_for_period("2024-01-01")
            .expect("period read");
        assert_eq!(all.len(), 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_task_and_ledger_rows_share_user_keyspace() {
        let path = temp_db_path("records_db_keyspace");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x8888888888888888888888888888888888888888";

        db.insert_pending_task(&sample_task(user, "task_mixed"))
            .expect("insert task");
        db.upsert_point_entry(user, "2024-01-01", 5.0)
            .expect("insert points");

        let history = db.user_task_history(user, 50).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].task_id, "task_mixed");

        let counts = db.task_status_counts().expect("counts");
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.total(), 1);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_purge_only_removes_old_terminal_tasks() {
        let path = temp_db_path("records_db_purge");
        let db = RecordsDb::open(&path).expect("db open");
        let user = "0x9999999999999999999999999999999999999999";

        db.insert_pending_task(&sample_task(user, "task_done"))
            .expect("insert done");
        db.upsert_point_entry(user, "2024-01-01", 1.0)
            .expect("points");

        let now = now_ms();
        let claimed = db
            .claim_next_pending(now)
            .expect("claim")
            .expect("claimed");
        assert!(db
            .confirm_task(&claimed.task_id, claimed.claim_seq, "0x1", 1, 1)
            .expect("confirm"));
        db.insert_pending_task(&sample_task(user, "task_live"))
            .expect("insert live");

        let purged = db
            .purge_terminal_tasks_before(now + 100_000)
            .expect("purge");
        assert_eq!(purged, 1);
        assert!(db.task_by_id("task_done").expect("lookup").is_none());
        assert!(db.task_by_id("task_live").expect("lookup").is_some());
        assert!(db
            .point_entry(user, "2024-01-01")
            .expect("points read")
            .is_some());
        assert_eq!(db.task_status_counts().expect("counts").total(), 1);

        let _ = fs::remove_file(path);
    }
}
