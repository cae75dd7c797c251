use crate::error::{ConfigError, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_RECORDS_DB_PATH: &str = "records.db";
const DEFAULT_LEADERBOARD_DB_PATH: &str = "leaderboard.db";

/// Everything the relay reads from the environment, parsed and validated
/// once at startup.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub api_key: String,
    pub bind_addr: SocketAddr,
    pub records_db_path: PathBuf,
    pub leaderboard_db_path: PathBuf,
    pub enclave_addr: String,
    pub enclave_connect_timeout: Duration,
    pub enclave_execute_timeout: Duration,
    pub session_probe_interval: Duration,
    pub session_startup_attempts: u32,
    pub worker_poll_interval: Duration,
    pub worker_concurrency: usize,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_ms: u64,
    pub liveness_timeout: Duration,
    pub sweep_interval: Duration,
    pub settlement_batch_size: usize,
    pub settlement_poll_interval: Duration,
    pub settlement_catchup_delay: Duration,
    pub settlement_period: Option<String>,
    pub task_retention: Option<Duration>,
    pub ops_status_interval: Duration,
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_u64(key, default_secs))
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RelayConfig {
    pub fn load() -> Result<Self> {
        let api_key = env_string("RELAY_API_KEY").ok_or_else(|| {
            ConfigError::MissingConfig("RELAY_API_KEY must be set to a non-empty value".to_string())
        })?;

        let bind_raw =
            env_string("RELAY_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_raw.parse::<SocketAddr>().map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "RELAY_BIND_ADDR must be host:port, got `{bind_raw}`: {e}"
            ))
        })?;

        let settlement_period = env_string("SETTLEMENT_PERIOD");
        if let Some(period) = settlement_period.as_deref() {
            chrono::NaiveDate::parse_from_str(period, "%Y-%m-%d").map_err(|_| {
                ConfigError::InvalidConfig(format!(
                    "SETTLEMENT_PERIOD must be YYYY-MM-DD, got `{period}`"
                ))
            })?;
        }

        // Task records are kept for audit; purging is strictly opt-in.
        let retention_days = env_u64("TASK_RETENTION_DAYS", 0);
        let task_retention =
            (retention_days > 0).then(|| Duration::from_secs(retention_days * 86_400));

        Ok(Self {
            api_key,
            bind_addr,
            records_db_path: env_string("RECORDS_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDS_DB_PATH)),
            leaderboard_db_path: env_string("LEADERBOARD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEADERBOARD_DB_PATH)),
            enclave_addr: env_string("ENCLAVE_ADDR")
                .unwrap_or_else(|| crate::enclave::DEFAULT_ENCLAVE_ADDR.to_string()),
            enclave_connect_timeout: env_secs("ENCLAVE_CONNECT_TIMEOUT_SECS", 10),
            enclave_execute_timeout: env_secs("ENCLAVE_EXECUTE_TIMEOUT_SECS", 60),
            session_probe_interval: env_secs("SESSION_PROBE_SECS", 30),
            session_startup_attempts: env_u64("SESSION_STARTUP_ATTEMPTS", 5).clamp(1, 60) as u32,
            worker_poll_interval: env_secs("WORKER_POLL_SECS", 2),
            worker_concurrency: env_u64("WORKER_CONCURRENCY", 2).clamp(1, 16) as usize,
            retry_backoff_base_ms: env_u64(
                "RETRY_BACKOFF_BASE_MS",
                crate::worker::DEFAULT_BACKOFF_BASE_MS,
            ),
            retry_backoff_cap_ms: env_u64(
                "RETRY_BACKOFF_CAP_MS",
                crate::worker::DEFAULT_BACKOFF_CAP_MS,
            ),
            liveness_timeout: env_secs(
                "LIVENESS_TIMEOUT_SECS",
                crate::worker::DEFAULT_LIVENESS_TIMEOUT_SECS,
            ),
            sweep_interval: env_secs("SWEEP_INTERVAL_SECS", 60),
            settlement_batch_size: env_u64(
                "SETTLEMENT_BATCH_SIZE",
                crate::settlement::DEFAULT_BATCH_SIZE as u64,
            )
            .clamp(1, 500) as usize,
            settlement_poll_interval: env_secs("SETTLEMENT_POLL_SECS", 300),
            settlement_catchup_delay: Duration::from_millis(env_u64(
                "SETTLEMENT_CATCHUP_DELAY_MS",
                500,
            )),
            settlement_period,
            task_retention,
            ops_status_interval: env_secs("OPS_STATUS_SECS", 60),
        })
    }
}
