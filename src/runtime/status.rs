use std::time::Duration;
use tokio::sync::broadcast;

use crate::enclave::SignerSession;
use crate::settlement::previous_utc_day;
use crate::storage::{LeaderboardDb, RecordsDb, TaskStatusCounts};
use crate::utils::RelayConfig;

pub fn emit_startup_status(config: &RelayConfig, counts: &TaskStatusCounts) {
    tracing::info!(
        "[OPS] Relay configured: bind={} enclave={} workers={} poll={:?} liveness={:?} batch={} retention={}",
        config.bind_addr,
        config.enclave_addr,
        config.worker_concurrency,
        config.worker_poll_interval,
        config.liveness_timeout,
        config.settlement_batch_size,
        config
            .task_retention
            .map(|d| format!("{}d", d.as_secs() / 86_400))
            .unwrap_or_else(|| "off".to_string())
    );
    tracing::info!(
        "[OPS] Records store: pending={} executing={} confirmed={} failed={} total={}",
        counts.pending,
        counts.executing,
        counts.confirmed,
        counts.failed,
        counts.total()
    );
}

fn emit_periodic_status(
    records: &RecordsDb,
    leaderboard: &LeaderboardDb,
    session: &SignerSession,
    period_override: Option<&str>,
) {
    let counts = match records.task_status_counts() {
        Ok(counts) => counts,
        Err(err) => {
            tracing::warn!("[OPS] Status sweep could not read task counts: {:#}", err);
            return;
        }
    };

    let period = period_override
        .map(str::to_string)
        .unwrap_or_else(previous_utc_day);
    let cursor = match leaderboard.snapshot(&period) {
        Ok(Some(snapshot)) => format!(
            "{}/{}{}",
            snapshot.last_processed_index,
            snapshot.entries.len(),
            if snapshot.processing_complete {
                " (complete)"
            } else {
                ""
            }
        ),
        Ok(None) => "no snapshot".to_string(),
        Err(_) => "unreadable".to_string(),
    };

    tracing::info!(
        "[OPS] Status: session={} pending={} executing={} confirmed={} failed={} period={} cursor={}",
        session.state().as_str(),
        counts.pending,
        counts.executing,
        counts.confirmed,
        counts.failed,
        period,
        cursor
    );
}

/// Periodic one-line operational summary so a tail of the logs always shows
/// queue depth, session health and settlement progress.
pub async fn start_status_loop(
    records: RecordsDb,
    leaderboard: LeaderboardDb,
    session: SignerSession,
    period_override: Option<String>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.recv() => {
                return;
            }
        }
        emit_periodic_status(&records, &leaderboard, &session, period_override.as_deref());
    }
}
