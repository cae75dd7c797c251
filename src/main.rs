//! Relay daemon: HTTP intake, execution workers, signer session upkeep and
//! settlement scheduling in one process.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use lend_relay::api::{self, ApiState};
use lend_relay::enclave::{start_session_probe, EnclaveClient, SignerSession};
use lend_relay::runtime::{emit_startup_status, ensure_env_only_invocation, start_status_loop};
use lend_relay::settlement::{start_settlement_loop, SettlementProcessor};
use lend_relay::storage::{now_ms, LeaderboardDb, RecordsDb};
use lend_relay::submission::SubmissionService;
use lend_relay::utils::telemetry;
use lend_relay::utils::{harden_env_setup, RelayConfig};
use lend_relay::worker::{start_retention_sweep, start_sweeper, start_worker, WorkerSettings};

const SESSION_RETRY_DELAY: Duration = Duration::from_secs(2);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Validate environment files and load defaults before runtime initialization.
    harden_env_setup();
    ensure_env_only_invocation()?;

    match std::env::var("RUST_LOG") {
        Ok(val) => println!("[STARTUP] RUST_LOG is set to: '{}'", val),
        Err(_) => println!("[STARTUP] RUST_LOG is unset."),
    }

    // Default to `info` when `RUST_LOG` is unset or invalid to avoid silent startup.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        println!("[STARTUP] RUST_LOG invalid or unset; defaulting to 'info'");
        tracing_subscriber::EnvFilter::new("info")
    });
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    println!("[STARTUP] Tracing initialized.");

    telemetry::install_panic_hook_once();
    println!("[STARTUP] Panic hook installed.");
    telemetry::init_telemetry();
    println!("[STARTUP] Telemetry initialized.");
    telemetry::emit(telemetry::TelemetryLevel::Info, "startup", "lend_relay boot");

    let config = RelayConfig::load()?;

    let records = RecordsDb::open(&config.records_db_path)?;
    let leaderboard = LeaderboardDb::open(&config.leaderboard_db_path)?;
    let counts = records.task_status_counts()?;
    emit_startup_status(&config, &counts);

    // Probe the signer enclave before accepting work so configuration failures
    // are visible immediately. A down enclave is not fatal: the relay serves
    // degraded and workers hold off until the session recovers.
    println!(
        "[STARTUP] Probing signer enclave at {}...",
        config.enclave_addr
    );
    let client = EnclaveClient::new(
        config.enclave_addr.clone(),
        config.enclave_connect_timeout,
        config.enclave_execute_timeout,
    );
    let session = SignerSession::new(Arc::new(client));
    let session_state = session
        .initialize(config.session_startup_attempts, SESSION_RETRY_DELAY)
        .await;
    if session_state.is_ready() {
        println!("[STARTUP] SIGNER SESSION OK.");
    } else {
        println!(
            "[STARTUP] SIGNER SESSION NOT READY ({}); tasks stay queued until it recovers.",
            session_state.as_str()
        );
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    #[cfg(unix)]
    {
        let shutdown_tx_sigterm = shutdown_tx.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut term_signal) = signal(SignalKind::terminate()) else {
                return;
            };
            let _ = term_signal.recv().await;
            telemetry::emit_critical("sigterm", "SIGTERM received; shutting down");
            let _ = shutdown_tx_sigterm.send(());
        });
    }

    let worker_settings = WorkerSettings {
        poll_interval: config.worker_poll_interval,
        backoff_base_ms: config.retry_backoff_base_ms,
        backoff_cap_ms: config.retry_backoff_cap_ms,
    };
    for worker_id in 0..config.worker_concurrency {
        let records_worker = records.clone();
        let session_worker = session.clone();
        let settings = worker_settings.clone();
        let shutdown_rx_worker = shutdown_tx.subscribe();
        tokio::spawn(async move {
            start_worker(
                worker_id,
                records_worker,
                session_worker,
                settings,
                shutdown_rx_worker,
            )
            .await;
        });
    }

    {
        let records_sweep = records.clone();
        let liveness = config.liveness_timeout;
        let interval = config.sweep_interval;
        let shutdown_rx_sweep = shutdown_tx.subscribe();
        tokio::spawn(async move {
            start_sweeper(records_sweep, liveness, interval, shutdown_rx_sweep).await;
        });
    }

    if let Some(retention) = config.task_retention {
        let records_retention = records.clone();
        let shutdown_rx_retention = shutdown_tx.subscribe();
        tokio::spawn(async move {
            start_retention_sweep(records_retention, retention, shutdown_rx_retention).await;
        });
    }

    {
        let session_probe = session.clone();
        let interval = config.session_probe_interval;
        let shutdown_rx_probe = shutdown_tx.subscribe();
        tokio::spawn(async move {
            start_session_probe(session_probe, interval, shutdown_rx_probe).await;
        });
    }

    let settlement = SettlementProcessor::new(
        records.clone(),
        leaderboard.clone(),
        config.settlement_batch_size,
    );
    {
        let processor = settlement.clone();
        let poll = config.settlement_poll_interval;
        let catchup = config.settlement_catchup_delay;
        let period = config.settlement_period.clone();
        let shutdown_rx_settle = shutdown_tx.subscribe();
        tokio::spawn(async move {
            start_settlement_loop(processor, poll, catchup, period, shutdown_rx_settle).await;
        });
    }

    {
        let records_status = records.clone();
        let leaderboard_status = leaderboard.clone();
        let session_status = session.clone();
        let period = config.settlement_period.clone();
        let interval = config.ops_status_interval;
        let shutdown_rx_status = shutdown_tx.subscribe();
        tokio::spawn(async move {
            start_status_loop(
                records_status,
                leaderboard_status,
                session_status,
                period,
                interval,
                shutdown_rx_status,
            )
            .await;
        });
    }

    let api_state = ApiState {
        records: records.clone(),
        submission: SubmissionService::new(records.clone()),
        session: session.clone(),
        settlement,
        api_key: config.api_key.clone(),
        restart_attempts: config.session_startup_attempts,
        restart_delay: SESSION_RETRY_DELAY,
        started_at_ms: now_ms(),
        terminal_tasks: Arc::new(DashMap::new()),
    };
    let bind_addr = config.bind_addr;
    let server_shutdown_rx = shutdown_tx.subscribe();
    let mut server =
        tokio::spawn(async move { api::serve(api_state, bind_addr, server_shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("[OPS] Ctrl+C received; starting graceful shutdown");
            telemetry::emit(
                telemetry::TelemetryLevel::Info,
                "shutdown",
                "Ctrl+C received; graceful shutdown started",
            );
            let _ = shutdown_tx.send(());
            match server.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!("[OPS] HTTP server ended with error during shutdown: {:#}", err);
                }
                Err(err) => tracing::error!("[OPS] HTTP server task failed: {}", err),
            }
        }
        result = &mut server => {
            let _ = shutdown_tx.send(());
            match result {
                Ok(Ok(())) => tracing::info!("[OPS] HTTP server exited; shutting down"),
                Ok(Err(err)) => {
                    telemetry::emit_critical(
                        "http_server",
                        format!("HTTP server failed: {err:#}"),
                    );
                    return Err(err);
                }
                Err(err) => {
                    return Err(anyhow::anyhow!("HTTP server task failed: {err}"));
                }
            }
        }
    }

    tracing::info!(
        "[OPS] Waiting {:?} for workers to finish in-flight tasks...",
        SHUTDOWN_DRAIN
    );
    tokio::time::sleep(SHUTDOWN_DRAIN).await;
    tracing::info!("[OPS] Relay shutdown complete.");

    Ok(())
}
