//! Signer session against the enclave host. The relay never holds keys; every
//! transaction is signed and broadcast by the enclave, reached over
//! newline-delimited JSON on TCP with one connection per request.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::error::ExecutionError;
use crate::storage::TaskRecord;
use crate::utils::telemetry;

pub const DEFAULT_ENCLAVE_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_EXECUTE_TIMEOUT: Duration = Duration::from_secs(60);

/// Reason substrings that mark a signer failure as permanent. Anything not
/// matched here (timeouts, connection drops, nonce races) is worth retrying.
const FATAL_ERROR_NEEDLES: &[&str] = &[
    "insufficient funds",
    "insufficient collateral",
    "insufficient balance",
    "reverted",
    "invalid",
    "allowance",
];

/// Payload forwarded to the enclave for one claimed task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub user_address: String,
    pub action: String,
    pub asset: String,
    pub amount: String,
    pub max_gas_price: String,
}

impl ExecutionRequest {
    pub fn from_task(task: &TaskRecord) -> Self {
        Self {
            user_address: task.user_address.clone(),
            action: task.action.as_str().to_string(),
            asset: task.asset.as_str().to_string(),
            amount: task.amount.clone(),
            max_gas_price: task.max_gas_price.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReceipt {
    pub transaction_hash: String,
    pub gas_used: u64,
    pub block_number: u64,
}

#[derive(Debug, Clone)]
pub struct SignerHealth {
    pub signer_address: String,
    pub chain_id: Option<u64>,
    pub latest_block: Option<u64>,
}

/// Opaque sign-and-broadcast capability. The worker only ever sees this
/// trait; the enclave client below is the production implementation.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn health_check(&self) -> Result<SignerHealth, ExecutionError>;
    async fn execute_transaction(
        &self,
        task_id: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionReceipt, ExecutionError>;
}

// ---------------------------------------------------------------------------
// Enclave TCP client
// ---------------------------------------------------------------------------

pub struct EnclaveClient {
    addr: String,
    connect_timeout: Duration,
    execute_timeout: Duration,
}

impl EnclaveClient {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration, execute_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            execute_timeout,
        }
    }

    /// One request, one connection: connect, write a single JSON line, read a
    /// single JSON line back.
    async fn round_trip(
        &self,
        op_timeout: Duration,
        message: &serde_json::Value,
    ) -> Result<serde_json::Value, ExecutionError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ExecutionError::Timeout {
                waited_ms: self.connect_timeout.as_millis() as u64,
                context: format!("connect to signer at {}", self.addr),
            })?
            .map_err(|err| {
                ExecutionError::SessionUnavailable(format!("connect {}: {}", self.addr, err))
            })?;

        let exchange = async {
            let (read_half, mut write_half) = stream.into_split();
            let mut line = serde_json::to_string(message)
                .map_err(|err| ExecutionError::Transient(format!("encode request: {err}")))?;
            line.push('\n');
            write_half
                .write_all(line.as_bytes())
                .await
                .map_err(|err| ExecutionError::Transient(format!("write to signer: {err}")))?;

            let mut reader = BufReader::new(read_half);
            let mut response_line = String::new();
            let read = reader
                .read_line(&mut response_line)
                .await
                .map_err(|err| ExecutionError::Transient(format!("read from signer: {err}")))?;
            if read == 0 {
                return Err(ExecutionError::Transient(
                    "signer closed the connection before responding".to_string(),
                ));
            }
            serde_json::from_str::<serde_json::Value>(response_line.trim())
                .map_err(|err| ExecutionError::Transient(format!("malformed signer response: {err}")))
        };

        tokio::time::timeout(op_timeout, exchange)
            .await
            .map_err(|_| ExecutionError::Timeout {
                waited_ms: op_timeout.as_millis() as u64,
                context: format!("signer round trip to {}", self.addr),
            })?
    }
}

#[async_trait]
impl TransactionSigner for EnclaveClient {
    async fn health_check(&self) -> Result<SignerHealth, ExecutionError> {
        let message = serde_json::json!({
            "type": "HEALTH_CHECK",
            "requestId": format!("health_{}", crate::storage::now_ms()),
            "data": {},
        });
        let response = self.round_trip(self.connect_timeout, &message).await?;
        parse_health_response(&response)
    }

    async fn execute_transaction(
        &self,
        task_id: &str,
        request: &ExecutionRequest,
    ) -> Result<ExecutionReceipt, ExecutionError> {
        let message = serde_json::json!({
            "type": "EXECUTE_TRANSACTION",
            "requestId": task_id,
            "data": request,
        });
        let response = self.round_trip(self.execute_timeout, &message).await?;
        parse_execute_response(&response)
    }
}

fn parse_health_response(value: &serde_json::Value) -> Result<SignerHealth, ExecutionError> {
    if !value.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        let reason = value
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("health check rejected");
        return Err(ExecutionError::SessionUnavailable(reason.to_string()));
    }
    let signer_address = value
        .get("walletAddress")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ExecutionError::SessionUnavailable("health response missing walletAddress".to_string())
        })?;
    Ok(SignerHealth {
        signer_address,
        chain_id: value.get("chainId").and_then(value_as_u64),
        latest_block: value.get("latestBlock").and_then(value_as_u64),
    })
}

fn parse_execute_response(value: &serde_json::Value) -> Result<ExecutionReceipt, ExecutionError> {
    let success = value.get("success").and_then(|v| v.as_bool()).unwrap_or(false);
    if !success {
        let reason = value
            .get("error")
            .and_then(|v| v.as_str())
            .unwrap_or("signer rejected the transaction without a reason");
        return Err(classify_signer_error(reason));
    }
    let transaction_hash = value
        .get("transactionHash")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ExecutionError::Transient("success response missing transactionHash".to_string())
        })?;
    Ok(ExecutionReceipt {
        transaction_hash,
        gas_used: value.get("gasUsed").and_then(value_as_u64).unwrap_or(0),
        block_number: value.get("blockNumber").and_then(value_as_u64).unwrap_or(0),
    })
}

/// The enclave reports gas as a decimal string and block numbers as JSON
/// numbers; accept either form in any numeric field.
fn value_as_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
}

/// Reason-string classification: fatal needles mean the transaction can never
/// succeed as submitted, so the retry budget must not be burned on it.
pub fn classify_signer_error(reason: &str) -> ExecutionError {
    let lowered = reason.to_ascii_lowercase();
    if FATAL_ERROR_NEEDLES.iter().any(|needle| lowered.contains(needle)) {
        ExecutionError::Fatal(reason.to_string())
    } else {
        ExecutionError::Transient(reason.to_string())
    }
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Ready { signer_address: String },
    Unavailable { reason: String },
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Initializing => "initializing",
            SessionState::Ready { .. } => "ready",
            SessionState::Unavailable { .. } => "unavailable",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready { .. })
    }
}

/// Tracks whether the signing capability is usable. Workers consult this
/// before claiming anything so tasks stay PENDING, with no retries burned,
/// while the enclave is down.
#[derive(Clone)]
pub struct SignerSession {
    signer: Arc<dyn TransactionSigner>,
    state: Arc<RwLock<SessionState>>,
}

impl SignerSession {
    pub fn new(signer: Arc<dyn TransactionSigner>) -> Self {
        Self {
            signer,
            state: Arc::new(RwLock::new(SessionState::Initializing)),
        }
    }

    pub fn signer(&self) -> Arc<dyn TransactionSigner> {
        self.signer.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .map(|state| state.clone())
            .unwrap_or(SessionState::Initializing)
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    fn set_state(&self, next: SessionState) -> SessionState {
        match self.state.write() {
            Ok(mut state) => std::mem::replace(&mut *state, next),
            Err(_) => SessionState::Initializing,
        }
    }

    /// One readiness handshake. Returns the resulting state and transitions
    /// Ready ↔ Unavailable as the probe outcome dictates.
    pub async fn probe(&self) -> SessionState {
        let next = match self.signer.health_check().await {
            Ok(health) => SessionState::Ready {
                signer_address: health.signer_address,
            },
            Err(err) => SessionState::Unavailable {
                reason: err.to_string(),
            },
        };
        let previous = self.set_state(next.clone());
        log_transition(&previous, &next);
        next
    }

    /// Bounded startup handshake: probe until Ready or the attempt budget is
    /// spent. The relay still starts when this fails; the background probe
    /// keeps trying.
    pub async fn initialize(&self, attempts: u32, retry_delay: Duration) -> SessionState {
        let attempts = attempts.max(1);
        for attempt in 1..=attempts {
            let state = self.probe().await;
            if state.is_ready() {
                return state;
            }
            if attempt < attempts {
                tracing::warn!(
                    "[SESSION] Signer not ready (attempt {}/{}); retrying in {:?}",
                    attempt,
                    attempts,
                    retry_delay
                );
                tokio::time::sleep(retry_delay).await;
            }
        }
        self.state()
    }

    /// Forced re-initialization, used by the admin endpoint.
    pub async fn restart(&self, attempts: u32, retry_delay: Duration) -> SessionState {
        tracing::info!("[SESSION] Restart requested");
        self.set_state(SessionState::Initializing);
        self.initialize(attempts, retry_delay).await
    }
}

fn log_transition(previous: &SessionState, next: &SessionState) {
    match (previous.is_ready(), next) {
        (false, SessionState::Ready { signer_address }) => {
            tracing::info!("[SESSION] Signer session ready; signer address {}", signer_address);
            telemetry::emit_success(
                "signer_session",
                format!("Signer session ready ({signer_address})"),
            );
        }
        (true, SessionState::Unavailable { reason }) => {
            tracing::error!("[SESSION] Signer session lost: {}", reason);
            telemetry::emit_critical("signer_session", format!("Signer session lost: {reason}"));
        }
        (false, SessionState::Unavailable { reason }) => {
            tracing::warn!("[SESSION] Signer unavailable: {}", reason);
        }
        _ => {}
    }
}

/// Background re-probe; keeps the session state honest while the relay runs.
pub async fn start_session_probe(
    session: SignerSession,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately and initialize() already probed.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                session.probe().await;
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("[SESSION] Probe loop shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_fatal_needles_classify_as_fatal() {
        let fatal = [
            "Insufficient funds for gas",
            "execution reverted: borrow cap reached",
            "Invalid asset configuration",
            "ERC20: transfer amount exceeds allowance",
            "insufficient collateral for borrow",
        ];
        for reason in fatal {
            assert!(
                matches!(classify_signer_error(reason), ExecutionError::Fatal(_)),
                "{reason} must be fatal"
            );
        }

        let transient = [
            "Enclave communication timeout",
            "connection reset by peer",
            "nonce too low",
            "Transaction timeout: not mined within 300s",
        ];
        for reason in transient {
            let classified = classify_signer_error(reason);
            assert!(
                classified.is_retryable() && matches!(classified, ExecutionError::Transient(_)),
                "{reason} must be transient"
            );
        }
    }

    #[test]
    fn test_execute_response_parsing() {
        let ok = serde_json::json!({
            "requestId": "task_1",
            "success": true,
            "transactionHash": "0xabc",
            "gasUsed": "84321",
            "blockNumber": 1234,
        });
        let receipt = parse_execute_response(&ok).expect("success parses");
        assert_eq!(receipt.transaction_hash, "0xabc");
        assert_eq!(receipt.gas_used, 84_321);
        assert_eq!(receipt.block_number, 1_234);

        let failed = serde_json::json!({
            "success": false,
            "error": "Transaction reverted",
        });
        assert!(matches!(
            parse_execute_response(&failed).expect_err("failure"),
            ExecutionError::Fatal(_)
        ));

        let missing_hash = serde_json::json!({"success": true});
        assert!(matches!(
            parse_execute_response(&missing_hash).expect_err("malformed"),
            ExecutionError::Transient(_)
        ));
    }

    #[test]
    fn test_health_response_parsing() {
        let ok = serde_json::json!({
            "success": true,
            "status": "healthy",
            "walletAddress": "0xfeed",
            "chainId": 8217,
            "latestBlock": "99",
        });
        let health = parse_health_response(&ok).expect("parses");
        assert_eq!(health.signer_address, "0xfeed");
        assert_eq!(health.chain_id, Some(8217));
        assert_eq!(health.latest_block, Some(99));

        let rejected = serde_json::json!({"success": false, "error": "no key material"});
        assert!(matches!(
            parse_health_response(&rejected).expect_err("rejected"),
            ExecutionError::SessionUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn test_session_transitions_through_probe() {
        let signer = Arc::new(testing::ScriptedSigner::new(Vec::new()));
        let session = SignerSession::new(signer.clone());
        assert_eq!(session.state().as_str(), "initializing");

        let state = session.initialize(3, Duration::from_millis(1)).await;
        assert!(state.is_ready());
        assert!(session.is_ready());

        signer.set_healthy(false);
        let state = session.probe().await;
        assert_eq!(state.as_str(), "unavailable");
        assert!(!session.is_ready());

        signer.set_healthy(true);
        let state = session.restart(2, Duration::from_millis(1)).await;
        assert!(matches!(
            state,
            SessionState::Ready { ref signer_address }
                if signer_address.as_str() == testing::TEST_SIGNER_ADDRESS
        ));
    }

    #[tokio::test]
    async fn test_initialize_gives_up_after_attempt_budget() {
        let signer = Arc::new(testing::ScriptedSigner::new(Vec::new()));
        signer.set_healthy(false);
        let session = SignerSession::new(signer);
        let state = session.initialize(2, Duration::from_millis(1)).await;
        assert_eq!(state.as_str(), "unavailable");
    }

    #[tokio::test]
    async fn test_client_round_trip_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let read = socket.read(&mut buf).await.expect("read request");
            let request: serde_json::Value =
                serde_json::from_slice(&buf[..read]).expect("request json");
            assert_eq!(request["type"], "HEALTH_CHECK");
            let response = serde_json::json!({
                "requestId": request["requestId"],
                "success": true,
                "status": "healthy",
                "walletAddress": "0xfeed",
                "chainId": 8217,
                "latestBlock": 42,
            });
            let line = format!("{response}\n");
            socket.write_all(line.as_bytes()).await.expect("write");
        });

        let client = EnclaveClient::new(
            addr.to_string(),
            Duration::from_secs(2),
            Duration::from_secs(2),
        );
        let health = client.health_check().await.expect("health");
        assert_eq!(health.signer_address, "0xfeed");
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn test_client_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.expect("accept");
            // Hold the connection open without ever responding.
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(socket);
        });

        let client = EnclaveClient::new(
            addr.to_string(),
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        let request = ExecutionRequest {
            user_address: "0x1".to_string(),
            action: "supply".to_string(),
            asset: "USDT".to_string(),
            amount: "1".to_string(),
            max_gas_price: "50".to_string(),
        };
        let err = client
            .execute_transaction("task_x", &request)
            .await
            .expect_err("must time out");
        assert!(matches!(err, ExecutionError::Timeout { .. }));
        assert!(err.is_retryable());
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn test_connect_refused_reports_session_unavailable() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let client = EnclaveClient::new(
            addr.to_string(),
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        let err = client.health_check().await.expect_err("must fail");
        assert!(matches!(
            err,
            ExecutionError::SessionUnavailable(_) | ExecutionError::Timeout { .. }
        ));
    }
}
