use alloy::primitives::{keccak256, Address};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, ValidationError};
use crate::storage::{now_ms, Asset, NewTask, RecordsDb, TaskAction};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_MAX_GAS_PRICE: &str = "50";
pub const MAX_TASK_AMOUNT: u64 = 1_000_000;

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Raw submission body. Everything is optional at the wire level so that the
/// validator can name the missing fields instead of bouncing on deserialize;
/// `amount` and `maxGasPrice` stay as JSON values because callers send both
/// numbers and numeric strings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRequest {
    pub user_address: Option<String>,
    pub action: Option<String>,
    pub asset: Option<String>,
    pub amount: Option<serde_json::Value>,
    pub max_gas_price: Option<serde_json::Value>,
}

/// A submission that passed validation: address normalized to lowercase hex,
/// action and asset resolved to their fixed sets, amounts kept in the textual
/// form the caller sent.
#[derive(Debug, Clone)]
pub struct ValidatedTask {
    pub user_address: String,
    pub action: TaskAction,
    pub asset: Asset,
    pub amount: String,
    pub max_gas_price: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAcknowledgment {
    pub success: bool,
    pub task_id: String,
    pub status: &'static str,
    pub message: &'static str,
    pub estimated_time: &'static str,
    pub user_address: String,
    pub action: &'static str,
    pub asset: &'static str,
    pub amount: String,
    pub check_status_url: String,
}

#[derive(Debug, Clone)]
pub struct SubmissionService {
    records: RecordsDb,
}

impl SubmissionService {
    pub fn new(records: RecordsDb) -> Self {
        Self { records }
    }

    /// Validates, assigns a fresh request id and writes the PENDING record in
    /// one atomic insert. Identical payloads always become distinct tasks.
    pub fn submit(&self, request: &TaskRequest) -> Result<TaskAcknowledgment> {
        let validated = validate_task_request(request)?;
        let task_id = next_task_id(&validated.user_address);
        let created = self.records.insert_pending_task(&NewTask {
            task_id,
            user_address: validated.user_address,
            action: validated.action,
            asset: validated.asset,
            amount: validated.amount,
            max_gas_price: validated.max_gas_price,
            max_retries: DEFAULT_MAX_RETRIES,
        })?;
        tracing::info!(
            "[SUBMIT] Task {} queued for {} ({} {} {})",
            created.task_id,
            created.user_address,
            created.action.as_str(),
            created.amount,
            created.asset.as_str()
        );
        Ok(TaskAcknowledgment {
            success: true,
            check_status_url: format!("/execute/{}", created.task_id),
            task_id: created.task_id,
            status: created.status.as_str(),
            message: "Task submitted for execution",
            estimated_time: "30-60 seconds",
            user_address: created.user_address,
            action: created.action.as_str(),
            asset: created.asset.as_str(),
            amount: created.amount,
        })
    }
}

/// Field checks in submission order; the first failure wins and nothing is
/// written on any failure.
pub fn validate_task_request(
    request: &TaskRequest,
) -> std::result::Result<ValidatedTask, ValidationError> {
    let mut missing = Vec::new();
    let user_address_raw = present_text(request.user_address.as_deref());
    let action_raw = present_text(request.action.as_deref());
    let asset_raw = present_text(request.asset.as_deref());
    let amount_raw = request.amount.as_ref().and_then(decimal_text);
    if user_address_raw.is_none() {
        missing.push("userAddress");
    }
    if action_raw.is_none() {
        missing.push("action");
    }
    if asset_raw.is_none() {
        missing.push("asset");
    }
    if amount_raw.is_none() {
        missing.push("amount");
    }
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing.join(", ")));
    }

    let user_address_raw = user_address_raw.unwrap_or_default();
    let address = Address::from_str(&user_address_raw)
        .map_err(|_| ValidationError::InvalidAddress(user_address_raw.clone()))?;

    let action_raw = action_raw.unwrap_or_default();
    let action = TaskAction::parse(&action_raw).ok_or_else(|| ValidationError::InvalidAction {
        given: action_raw.clone(),
        allowed: TaskAction::ALLOWED,
    })?;

    let asset_raw = asset_raw.unwrap_or_default();
    let asset = Asset::parse(&asset_raw).ok_or_else(|| ValidationError::InvalidAsset {
        given: asset_raw.clone(),
        allowed: Asset::ALLOWED,
    })?;

    let amount_raw = amount_raw.unwrap_or_default();
    let amount_value = amount_raw
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| ValidationError::InvalidAmount(amount_raw.clone()))?;
    if amount_value > MAX_TASK_AMOUNT as f64 {
        return Err(ValidationError::AmountTooLarge {
            amount: amount_raw,
            max: MAX_TASK_AMOUNT,
        });
    }

    let max_gas_price = match request.max_gas_price.as_ref().and_then(decimal_text) {
        Some(raw) => {
            raw.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite() && *v > 0.0)
                .ok_or_else(|| ValidationError::InvalidGasPrice(raw.clone()))?;
            raw
        }
        None => DEFAULT_MAX_GAS_PRICE.to_string(),
    };

    Ok(ValidatedTask {
        user_address: format!("{address:#x}"),
        action,
        asset,
        amount: amount_raw,
        max_gas_price,
    })
}

fn present_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn decimal_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => present_text(Some(s)),
        _ => None,
    }
}

/// Request ids are `task_` plus 8 bytes of a keccak digest over the caller,
/// the current time and a process-wide counter. The counter keeps ids unique
/// even when one user submits twice in the same millisecond.
fn next_task_id(user_address: &str) -> String {
    let seq = TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut seed = Vec::with_capacity(user_address.len() + 16);
    seed.extend_from_slice(user_address.as_bytes());
    seed.extend_from_slice(&now_ms().to_be_bytes());
    seed.extend_from_slice(&seq.to_be_bytes());
    format!("task_{}", hex::encode(&keccak256(&seed)[..8]))
}
