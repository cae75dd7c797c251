//! Execution worker loops: claim PENDING tasks, drive them through the signer
//! session and settle the outcome with fenced store updates. Also hosts the
//! stale-claim sweeper and the optional terminal-record retention sweep.

use std::time::Duration;
use tokio::sync::broadcast;

use crate::enclave::{ExecutionRequest, SignerSession, TransactionSigner};
use crate::error::ExecutionError;
use crate::storage::{now_ms, RecordsDb, TaskRecord};
use crate::utils::error::compact_error_message;
use crate::utils::telemetry;

pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 60_000;
pub const DEFAULT_LIVENESS_TIMEOUT_SECS: u64 = 300;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
        }
    }
}

/// What happened to one claimed task after a signer round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Confirmed,
    Requeued { retry_count: u32 },
    Failed { retry_count: u32 },
    /// The fenced update matched nothing: the sweep reclaimed the task while
    /// this worker was executing it. Nothing left to do.
    LostClaim,
}

/// Exponential backoff before a retried task becomes claimable again:
/// `base * 2^(n-1)` for retry number `n`, capped.
pub fn retry_backoff_ms(base_ms: u64, cap_ms: u64, retry_number: u32) -> u64 {
    if retry_number == 0 {
        return 0;
    }
    let shift = retry_number.saturating_sub(1).min(32);
    base_ms.saturating_mul(1u64 << shift).min(cap_ms)
}

/// Runs one claimed task to its next state. All store transitions are fenced
/// by the claim sequence captured at claim time, so a task the sweep took
/// back is left alone no matter what the signer returned.
pub async fn execute_claimed_task(
    records: &RecordsDb,
    session: &SignerSession,
    settings: &WorkerSettings,
    task: &TaskRecord,
) -> anyhow::Result<TaskOutcome> {
    let request = ExecutionRequest::from_task(task);
    tracing::info!(
        "[WORKER] Executing task {} ({} {} {} for {})",
        task.task_id,
        task.action.as_str(),
        task.amount,
        task.asset.as_str(),
        task.user_address
    );

    let result = session
        .signer()
        .execute_transaction(&task.task_id, &request)
        .await;

    match result {
        Ok(receipt) => {
            let updated = records.confirm_task(
                &task.task_id,
                task.claim_seq,
                &receipt.transaction_hash,
                receipt.gas_used,
                receipt.block_number,
            )?;
            if !updated {
                tracing::warn!(
                    "[WORKER] Task {} finished but the claim was lost; leaving the record alone",
                    task.task_id
                );
                return Ok(TaskOutcome::LostClaim);
            }
            tracing::info!(
                "[WORKER] Task {} confirmed in block {} (tx {}, gas {})",
                task.task_id,
                receipt.block_number,
                receipt.transaction_hash,
                receipt.gas_used
            );
            Ok(TaskOutcome::Confirmed)
        }
        Err(err) => {
            if matches!(err, ExecutionError::SessionUnavailable(_)) {
                // Re-probe right away so other workers stop claiming into a
                // dead session instead of waiting for the periodic probe.
                session.probe().await;
            }
            let reason = compact_error_message(&err.reason());
            if !err.is_retryable() {
                return fail_task(records, task, task.retry_count, &reason);
            }

            let next = task.retry_count.saturating_add(1);
            if next < task.max_retries {
                let backoff = retry_backoff_ms(settings.backoff_base_ms, settings.backoff_cap_ms, next);
                let updated = records.requeue_task(
                    &task.task_id,
                    task.claim_seq,
                    next,
                    now_ms().saturating_add(backoff),
                    &reason,
                )?;
                if !updated {
                    tracing::warn!("[WORKER] Lost claim for task {} during requeue", task.task_id);
                    return Ok(TaskOutcome::LostClaim);
                }
                tracing::warn!(
                    "[WORKER] Task {} attempt {}/{} failed transiently: {}; eligible again in {}ms",
                    task.task_id,
                    next,
                    task.max_retries,
                    reason,
                    backoff
                );
                Ok(TaskOutcome::Requeued { retry_count: next })
            } else {
                fail_task(records, task, next, &reason)
            }
        }
    }
}

fn fail_task(
    records: &RecordsDb,
    task: &TaskRecord,
    retry_count: u32,
    reason: &str,
) -> anyhow::Result<TaskOutcome> {
    let updated = records.fail_task(&task.task_id, task.claim_seq, retry_count, reason)?;
    if !updated {
        tracing::warn!("[WORKER] Lost claim for task {} during failure", task.task_id);
        return Ok(TaskOutcome::LostClaim);
    }
    tracing::error!(
        "[WORKER] Task {} failed permanently (retries {}): {}",
        task.task_id,
        retry_count,
        reason
    );
    telemetry::emit_critical(
        "task_failed",
        format!("Task {} failed permanently: {}", task.task_id, reason),
    );
    Ok(TaskOutcome::Failed { retry_count })
}

/// Claim-and-execute loop. Skips claiming entirely while the signer session
/// is not ready so queued tasks wait without burning retries, and drains all
/// eligible work before sleeping.
pub async fn start_worker(
    worker_id: usize,
    records: RecordsDb,
    session: SignerSession,
    settings: WorkerSettings,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tracing::info!(
        "[WORKER] Worker {} started (poll every {:?})",
        worker_id,
        settings.poll_interval
    );
    loop {
        if shutdown_rx.try_recv().is_ok() {
            tracing::info!("[WORKER] Worker {} shutting down", worker_id);
            return;
        }

        if session.is_ready() {
            match records.claim_next_pending(now_ms()) {
                Ok(Some(task)) => {
                    if let Err(err) = execute_claimed_task(&records, &session, &settings, &task).await
                    {
                        tracing::error!(
                            "[WORKER] Store update for task {} failed: {:#}; the sweep will recover it",
                            task.task_id,
                            err
                        );
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!("[WORKER] Claim scan failed: {:#}", err);
                }
            }
        } else {
            tracing::debug!(
                "[WORKER] Worker {} idle; signer session is {}",
                worker_id,
                session.state().as_str()
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(settings.poll_interval) => {}
            _ = shutdown_rx.recv() => {
                tracing::info!("[WORKER] Worker {} shutting down", worker_id);
                return;
            }
        }
    }
}

/// Returns tasks stuck EXECUTING past the liveness timeout to the queue (or
/// fails them once the retry budget is spent). Safe to run alongside live
/// workers because every reclaim is a fenced conditional update.
pub async fn start_sweeper(
    records: RecordsDb,
    liveness_timeout: Duration,
    sweep_interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tracing::info!(
        "[SWEEP] Stale-claim sweeper started (liveness timeout {:?}, interval {:?})",
        liveness_timeout,
        sweep_interval
    );
    loop {
        tokio::select! {
            _ = tokio::time::sleep(sweep_interval) => {}
            _ = shutdown_rx.recv() => {
                tracing::info!("[SWEEP] Sweeper shutting down");
                return;
            }
        }

        match records.sweep_stale_executing(now_ms(), liveness_timeout.as_millis() as u64) {
            Ok(outcome) if outcome.requeued > 0 || outcome.failed > 0 => {
                tracing::warn!(
                    "[SWEEP] Reclaimed {} stale task(s): {} requeued, {} failed on exhausted retries",
                    outcome.requeued + outcome.failed,
                    outcome.requeued,
                    outcome.failed
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!("[SWEEP] Sweep failed: {:#}", err);
            }
        }
    }
}

/// Optional retention sweep over terminal records, gated by configuration.
pub async fn start_retention_sweep(
    records: RecordsDb,
    retention: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tracing::info!(
        "[SWEEP] Retention sweep enabled; purging terminal tasks older than {:?}",
        retention
    );
    loop {
        let cutoff = now_ms().saturating_sub(retention.as_millis() as u64);
        match records.purge_terminal_tasks_before(cutoff) {
            Ok(0) => {}
            Ok(purged) => {
                tracing::info!("[SWEEP] Purged {} terminal task record(s)", purged);
            }
            Err(err) => {
                tracing::error!("[SWEEP] Retention purge failed: {:#}", err);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(RETENTION_SWEEP_INTERVAL) => {}
            _ = shutdown_rx.recv() => {
                tracing::info!("[SWEEP] Retention sweep shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::testing::ScriptedSigner;
    use crate::enclave::ExecutionReceipt;
    use crate::storage::{Asset, NewTask, TaskAction, TaskStatus};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_db_path(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .ok()
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{}_{}.db", prefix, nanos))
    }

    fn seeded_task(records: &RecordsDb, id: &str) -> TaskRecord {
        records
            .insert_pending_task(&NewTask {
                task_id: id.to_string(),
                user_address: "0x1111111111111111111111111111111111111111".to_string(),
                action: TaskAction::Supply,
                asset: Asset::Usdt,
                amount: "10".to_string(),
                max_gas_price: "50".to_string(),
                max_retries: 3,
            })
            .expect("insert task")
    }

    async fn ready_session(signer: Arc<ScriptedSigner>) -> SignerSession {
        let session = SignerSession::new(signer);
        session.initialize(1, Duration::from_millis(1)).await;
        assert!(session.is_ready());
        session
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff_ms(1_000, 60_000, 1), 1_000);
        assert_eq!(retry_backoff_ms(1_000, 60_000, 2), 2_000);
        assert_eq!(retry_backoff_ms(1_000, 60_000, 3), 4_000);
        assert_eq!(retry_backoff_ms(1_000, 60_000, 7), 60_000);
        assert_eq!(retry_backoff_ms(1_000, 60_000, 40), 60_000);
        assert_eq!(retry_backoff_ms(500, 10_000, 4), 4_000);
    }

    #[tokio::test]
    async fn test_successful_execution_confirms_task() {
        let path = temp_db_path("worker_confirm");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_ok");
        let signer = Arc::new(ScriptedSigner::new(vec![Ok(ScriptedSigner::receipt("0xfee1"))]));
        let session = ready_session(signer.clone()).await;

        let task = records
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("claimed");
        let outcome = execute_claimed_task(&records, &session, &WorkerSettings::default(), &task)
            .await
            .expect("execute");
        assert_eq!(outcome, TaskOutcome::Confirmed);
        assert_eq!(signer.executed_tasks(), vec!["task_ok".to_string()]);

        let stored = records
            .task_by_id("task_ok")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Confirmed);
        assert_eq!(stored.tx_hash.as_deref(), Some("0xfee1"));
        assert_eq!(stored.retry_count, 0);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_transient_failure_requeues_with_backoff() {
        let path = temp_db_path("worker_requeue");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_flaky");
        let signer = Arc::new(ScriptedSigner::new(vec![Err(ExecutionError::Transient(
            "nonce too low".to_string(),
        ))]));
        let session = ready_session(signer).await;

        let before = now_ms();
        let task = records
            .claim_next_pending(before)
            .expect("claim")
            .expect("claimed");
        let outcome = execute_claimed_task(&records, &session, &WorkerSettings::default(), &task)
            .await
            .expect("execute");
        assert_eq!(outcome, TaskOutcome::Requeued { retry_count: 1 });

        let stored = records
            .task_by_id("task_flaky")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.not_before_ms >= before + 1_000);
        assert_eq!(stored.last_error.as_deref(), Some("nonce too low"));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_confirms() {
        let path = temp_db_path("worker_recover");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_recovers");
        let signer = Arc::new(ScriptedSigner::new(vec![
            Err(ExecutionError::Transient("enclave connection reset".to_string())),
            Ok(ScriptedSigner::receipt("0xsecond")),
        ]));
        let session = ready_session(signer).await;
        let settings = WorkerSettings::default();

        let task = records
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("claimed");
        let outcome = execute_claimed_task(&records, &session, &settings, &task)
            .await
            .expect("first attempt");
        assert_eq!(outcome, TaskOutcome::Requeued { retry_count: 1 });

        // Claim again with a clock past the backoff window.
        let task = records
            .claim_next_pending(now_ms() + 120_000)
            .expect("claim")
            .expect("claimable again");
        let outcome = execute_claimed_task(&records, &session, &settings, &task)
            .await
            .expect("second attempt");
        assert_eq!(outcome, TaskOutcome::Confirmed);

        let stored = records
            .task_by_id("task_recovers")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Confirmed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.tx_hash.as_deref(), Some("0xsecond"));
        assert_eq!(stored.last_error, None);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_exactly_max_retries_transient_failures_fail_the_task() {
        let path = temp_db_path("worker_exhaust");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_doomed");
        let transient = || Err(ExecutionError::Transient("rpc unreachable".to_string()));
        let signer = Arc::new(ScriptedSigner::new(vec![transient(), transient(), transient()]));
        let session = ready_session(signer).await;
        let settings = WorkerSettings::default();

        let mut outcomes = Vec::new();
        let mut clock = now_ms();
        for _ in 0..3 {
            clock += 120_000;
            let task = records
                .claim_next_pending(clock)
                .expect("claim")
                .expect("still claimable");
            outcomes.push(
                execute_claimed_task(&records, &session, &settings, &task)
                    .await
                    .expect("execute"),
            );
        }
        assert_eq!(
            outcomes,
            vec![
                TaskOutcome::Requeued { retry_count: 1 },
                TaskOutcome::Requeued { retry_count: 2 },
                TaskOutcome::Failed { retry_count: 3 },
            ]
        );

        let stored = records
            .task_by_id("task_doomed")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, stored.max_retries);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_fatal_failure_skips_remaining_retries() {
        let path = temp_db_path("worker_fatal");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_broke");
        let signer = Arc::new(ScriptedSigner::new(vec![Err(ExecutionError::Fatal(
            "insufficient funds for gas".to_string(),
        ))]));
        let session = ready_session(signer).await;

        let task = records
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("claimed");
        let outcome = execute_claimed_task(&records, &session, &WorkerSettings::default(), &task)
            .await
            .expect("execute");
        assert_eq!(outcome, TaskOutcome::Failed { retry_count: 0 });

        let stored = records
            .task_by_id("task_broke")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(
            stored.last_error.as_deref(),
            Some("insufficient funds for gas")
        );

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_lost_claim_leaves_record_untouched() {
        let path = temp_db_path("worker_lost");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_taken");
        let signer = Arc::new(ScriptedSigner::new(vec![Ok(ScriptedSigner::receipt("0xaaaa"))]));
        let session = ready_session(signer).await;

        let task = records
            .claim_next_pending(now_ms())
            .expect("claim")
            .expect("claimed");
        // Simulate the sweep reclaiming the task mid-flight.
        assert!(records
            .requeue_task("task_taken", task.claim_seq, 1, 0, "claim expired")
            .expect("sweep requeue"));

        let outcome = execute_claimed_task(&records, &session, &WorkerSettings::default(), &task)
            .await
            .expect("execute");
        assert_eq!(outcome, TaskOutcome::LostClaim);

        let stored = records
            .task_by_id("task_taken")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.tx_hash, None);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_worker_loop_drains_queue_and_honors_shutdown() {
        let path = temp_db_path("worker_loop");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_one");
        seeded_task(&records, "task_two");
        let signer = Arc::new(ScriptedSigner::new(vec![
            Ok(ScriptedSigner::receipt("0x01")),
            Ok(ScriptedSigner::receipt("0x02")),
        ]));
        let session = ready_session(signer.clone()).await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(10),
            ..WorkerSettings::default()
        };
        let handle = tokio::spawn(start_worker(
            0,
            records.clone(),
            session,
            settings,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_tx.send(()).expect("signal shutdown");
        handle.await.expect("worker exits");

        assert_eq!(signer.executed_tasks().len(), 2);
        let counts = records.task_status_counts().expect("counts");
        assert_eq!(counts.confirmed, 2);
        assert_eq!(counts.pending, 0);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_worker_does_not_claim_while_session_down() {
        let path = temp_db_path("worker_gate");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_waiting");
        let signer = Arc::new(ScriptedSigner::new(Vec::new()));
        signer.set_healthy(false);
        let session = SignerSession::new(signer.clone());
        session.initialize(1, Duration::from_millis(1)).await;
        assert!(!session.is_ready());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(10),
            ..WorkerSettings::default()
        };
        let handle = tokio::spawn(start_worker(
            0,
            records.clone(),
            session,
            settings,
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(150)).await;
        shutdown_tx.send(()).expect("signal shutdown");
        handle.await.expect("worker exits");

        assert!(signer.executed_tasks().is_empty());
        let stored = records
            .task_by_id("task_waiting")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_sweeper_loop_reclaims_stale_tasks() {
        let path = temp_db_path("worker_sweep_loop");
        let records = RecordsDb::open(&path).expect("db open");
        seeded_task(&records, "task_stuck");
        // Claiming with a backdated clock leaves updated_at in the past, so
        // the sweeper sees the claim as expired immediately.
        let claimed = records
            .claim_next_pending(now_ms().saturating_sub(400_000))
            .expect("claim");
        assert!(claimed.is_some());

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(start_sweeper(
            records.clone(),
            Duration::from_millis(0),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(()).expect("signal shutdown");
        handle.await.expect("sweeper exits");

        let stored = records
            .task_by_id("task_stuck")
            .expect("lookup")
            .expect("exists");
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, 1);

        let _ = std::fs::remove_file(path);
    }
}
