//! One-shot settlement runner. Processes the next leaderboard batch for one
//! period (or drives the period to completion with `--all`) and prints the
//! invocation summary as JSON on stdout.
//!
//! Usage: `settle_points [PERIOD] [--all]` where PERIOD defaults to
//! `SETTLEMENT_PERIOD` or the previous UTC day.

use lend_relay::settlement::{previous_utc_day, SettlementProcessor};
use lend_relay::storage::{LeaderboardDb, RecordsDb};
use lend_relay::utils::harden_env_setup;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_u64_env(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn main() {
    harden_env_setup();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let mut period_arg: Option<String> = None;
    let mut run_all = false;
    for arg in std::env::args().skip(1) {
        if arg == "--all" {
            run_all = true;
        } else if period_arg.is_none() {
            period_arg = Some(arg);
        } else {
            eprintln!("[SETTLE] Unexpected argument `{arg}`; usage: settle_points [PERIOD] [--all]");
            std::process::exit(2);
        }
    }
    let period = period_arg
        .or_else(|| env_string("SETTLEMENT_PERIOD"))
        .unwrap_or_else(previous_utc_day);
    let batch_size = parse_u64_env("SETTLEMENT_BATCH_SIZE", 25).clamp(1, 500) as usize;

    let records_path = env_string("RECORDS_DB_PATH").unwrap_or_else(|| "records.db".to_string());
    let board_path =
        env_string("LEADERBOARD_DB_PATH").unwrap_or_else(|| "leaderboard.db".to_string());

    let records = match RecordsDb::open(&records_path) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("[SETTLE] Records store open failed for {records_path}: {err:#}");
            std::process::exit(2);
        }
    };
    let leaderboard = match LeaderboardDb::open(&board_path) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("[SETTLE] Leaderboard store open failed for {board_path}: {err:#}");
            std::process::exit(2);
        }
    };

    let processor = SettlementProcessor::new(records, leaderboard, batch_size);
    loop {
        let summary = match processor.run(&period) {
            Ok(summary) => summary,
            Err(err) => {
                eprintln!("[SETTLE] Settlement for {period} failed: {err:#}");
                std::process::exit(1);
            }
        };
        let done = summary.processing_complete || summary.skipped_reason.is_some();
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{json}"),
            Err(_) => println!("{summary:?}"),
        }
        if !run_all || done {
            break;
        }
    }
    std::process::exit(0);
}
