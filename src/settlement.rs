//! Reward settlement: turns a daily leaderboard snapshot into point ledger
//! rows, one bounded batch per invocation, resumable through the snapshot
//! cursor. Safe to invoke concurrently; the cursor compare-and-set totally
//! orders batches within a period and the ledger writes are idempotent.

use chrono::{Days, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{Result, StoreError};
use crate::storage::{now_ms, LeaderboardDb, LeaderboardEntry, RecordsDb};
use crate::utils::telemetry;

pub const DEFAULT_BATCH_SIZE: usize = 25;

/// Bound on fresh-read retries after a lost cursor compare-and-set.
const CAS_ATTEMPTS: usize = 4;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementSummary {
    pub period: String,
    pub batch_size: usize,
    pub attempted: usize,
    pub unprocessed: usize,
    pub new_index: usize,
    pub total_entries: usize,
    pub processing_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

/// Score-descending ranking with ties left in stored snapshot order. The
/// stable sort is what makes the cursor deterministic across invocations.
pub fn rank_entries(entries: &[LeaderboardEntry]) -> Vec<LeaderboardEntry> {
    let mut ranked = entries.to_vec();
    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

/// The settlement period the scheduler targets: the previous UTC day.
pub fn previous_utc_day() -> String {
    let today = Utc::now().date_naive();
    today
        .checked_sub_days(Days::new(1))
        .unwrap_or(today)
        .format("%Y-%m-%d")
        .to_string()
}

#[derive(Debug, Clone)]
pub struct SettlementProcessor {
    records: RecordsDb,
    leaderboard: LeaderboardDb,
    batch_size: usize,
}

impl SettlementProcessor {
    pub fn new(records: RecordsDb, leaderboard: LeaderboardDb, batch_size: usize) -> Self {
        Self {
            records,
            leaderboard,
            batch_size: batch_size.max(1),
        }
    }

    /// One settlement invocation over one period. Reads the snapshot, writes
    /// the next batch of ledger rows, then advances the cursor by the number
    /// attempted through compare-and-set. A lost compare-and-set re-reads and
    /// re-runs from the fresh cursor rather than ever blind-writing.
    pub fn run(&self, period: &str) -> Result<SettlementSummary> {
        for _ in 0..CAS_ATTEMPTS {
            let Some(snapshot) = self.leaderboard.snapshot(period)? else {
                tracing::info!("[SETTLE] No leaderboard data for period {}; nothing to do", period);
                return Ok(SettlementSummary {
                    period: period.to_string(),
                    batch_size: self.batch_size,
                    attempted: 0,
                    unprocessed: 0,
                    new_index: 0,
                    total_entries: 0,
                    processing_complete: false,
                    skipped_reason: Some("no leaderboard data for period".to_string()),
                });
            };
            if snapshot.processing_complete {
                tracing::debug!("[SETTLE] Period {} already complete", period);
                return Ok(SettlementSummary {
                    period: period.to_string(),
                    batch_size: self.batch_size,
                    attempted: 0,
                    unprocessed: 0,
                    new_index: snapshot.last_processed_index,
                    total_entries: snapshot.entries.len(),
                    processing_complete: true,
                    skipped_reason: Some("period already settled".to_string()),
                });
            }

            let ranked = rank_entries(&snapshot.entries);
            let start = snapshot.last_processed_index.min(ranked.len());
            let end = start.saturating_add(self.batch_size).min(ranked.len());
            let batch = &ranked[start..end];

            let mut unprocessed = 0usize;
            for entry in batch {
                // The reward for a period is the entry's score; failed writes
                // get one retry within the invocation and are then counted,
                // because the cursor advances by attempted either way.
                let mut write = self
                    .records
                    .upsert_point_entry(&entry.address, period, entry.score);
                if write.is_err() {
                    write = self
                        .records
                        .upsert_point_entry(&entry.address, period, entry.score);
                }
                if let Err(err) = write {
                    unprocessed += 1;
                    tracing::warn!(
                        "[SETTLE] Ledger write failed twice for {} in {}: {:#}",
                        entry.address,
                        period,
                        err
                    );
                }
            }

            let attempted = batch.len();
            let new_index = start + attempted;
            let complete = new_index >= ranked.len();
            if !self
                .leaderboard
                .advance_cursor(period, start, new_index, complete, now_ms())?
            {
                tracing::warn!(
                    "[SETTLE] Cursor for {} moved past {} under us; re-reading",
                    period,
                    start
                );
                continue;
            }

            if attempted > 0 {
                tracing::info!(
                    "[SETTLE] Period {}: attempted {} (unprocessed {}), cursor {} -> {} of {}, complete={}",
                    period,
                    attempted,
                    unprocessed,
                    start,
                    new_index,
                    ranked.len(),
                    complete
                );
            }
            if complete {
                telemetry::emit_success(
                    "settlement",
                    format!(
                        "Settlement for {} complete: {} entries, {} unprocessed",
                        period,
                        ranked.len(),
                        unprocessed
                    ),
                );
            }
            return Ok(SettlementSummary {
                period: period.to_string(),
                batch_size: self.batch_size,
                attempted,
                unprocessed,
                new_index,
                total_entries: ranked.len(),
                processing_complete: complete,
                skipped_reason: None,
            });
        }

        Err(StoreError::Contention {
            context: format!("settlement cursor for period {period}"),
        }
        .into())
    }
}

/// Periodic settlement driver. Re-invokes with a short catch-up delay while a
/// period still has unprocessed entries, then settles back to the poll
/// interval.
pub async fn start_settlement_loop(
    processor: SettlementProcessor,
    poll_interval: Duration,
    catchup_delay: Duration,
    period_override: Option<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tracing::info!(
        "[SETTLE] Settlement scheduler started (poll {:?}, catch-up {:?}, period {})",
        poll_interval,
        catchup_delay,
        period_override.as_deref().unwrap_or("previous UTC day")
    );
    loop {
        let period = period_override.clone().unwrap_or_else(previous_utc_day);
        let sleep_for = match processor.run(&period) {
            Ok(summary) if !summary.processing_complete && summary.attempted > 0 => catchup_delay,
            Ok(_) => poll_interval,
            Err(err) => {
                tracing::error!("[SETTLE] Settlement invocation failed: {:#}", err);
                poll_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = shutdown_rx.recv() => {
                tracing::info!("[SETTLE] Settlement scheduler shutting down");
                return;
            }
        }
    }
}
