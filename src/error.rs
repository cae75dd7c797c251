use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("internal error: {0}")]
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

/// Rejections raised while admitting a task. Never retried; the reason string
/// goes straight back to the caller and no record is written.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required fields: {0}")]
    MissingFields(String),
    #[error("Invalid userAddress `{0}`: expected a 0x-prefixed 20-byte hex address")]
    InvalidAddress(String),
    #[error("Invalid action `{given}`. Must be one of: {allowed}")]
    InvalidAction { given: String, allowed: &'static str },
    #[error("Invalid asset `{given}`. Must be one of: {allowed}")]
    InvalidAsset { given: String, allowed: &'static str },
    #[error("Invalid amount `{0}`: must be a positive decimal")]
    InvalidAmount(String),
    #[error("Amount {amount} exceeds the per-task maximum of {max}")]
    AmountTooLarge { amount: String, max: u64 },
    #[error("Invalid maxGasPrice `{0}`: must be a positive decimal")]
    InvalidGasPrice(String),
}

/// Failures observed while driving a claimed task through the signer.
/// Everything except `Fatal` is eligible for re-queue within the retry budget.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("transient execution failure: {0}")]
    Transient(String),
    #[error("execution timed out after {waited_ms}ms: {context}")]
    Timeout { waited_ms: u64, context: String },
    #[error("signer session unavailable: {0}")]
    SessionUnavailable(String),
    #[error("fatal execution failure: {0}")]
    Fatal(String),
}

impl ExecutionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionError::Fatal(_))
    }

    /// The underlying reason without the classification prefix, suitable for
    /// storing on the task record.
    pub fn reason(&self) -> String {
        match self {
            ExecutionError::Transient(s)
            | ExecutionError::SessionUnavailable(s)
            | ExecutionError::Fatal(s) => s.clone(),
            ExecutionError::Timeout { waited_ms, context } => {
                format!("timed out after {waited_ms}ms: {context}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conditional update lost the race: {context}")]
    Contention { context: String },
    #[error("rejected snapshot for period {period}: {reason}")]
    InvalidSnapshot { period: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    MissingConfig(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
