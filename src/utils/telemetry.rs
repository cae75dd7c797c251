//! Operator alerting over Discord and Telegram webhooks. Events are queued on
//! a bounded channel and delivered by one background thread so emitting from
//! workers or request handlers never blocks on the network. When no webhook
//! is configured every emit is a no-op.

use serde_json::Value;
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use crate::storage::now_ms;

const DEFAULT_QUEUE_CAPACITY: usize = 512;
const DEFAULT_HTTP_TIMEOUT_MS: u64 = 2_000;

#[derive(Clone, Copy, Debug)]
pub enum TelemetryLevel {
    Info,
    Success,
    Critical,
}

#[derive(Clone, Debug)]
struct TelemetryEvent {
    ts_ms: u64,
    level: TelemetryLevel,
    kind: String,
    message: String,
    details: Option<Value>,
}

#[derive(Clone, Debug)]
struct WebhookTargets {
    discord_webhook_url: Option<String>,
    telegram_bot_token: Option<String>,
    telegram_chat_id: Option<String>,
    timeout_ms: u64,
}

static TELEMETRY_SENDER: OnceLock<SyncSender<TelemetryEvent>> = OnceLock::new();
static TELEMETRY_INIT_GUARD: OnceLock<Mutex<()>> = OnceLock::new();

fn load_queue_capacity() -> usize {
    std::env::var("TELEMETRY_QUEUE_CAPACITY")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .map(|v| v.clamp(64, 16_384))
        .unwrap_or(DEFAULT_QUEUE_CAPACITY)
}

fn load_timeout_ms() -> u64 {
    std::env::var("TELEMETRY_HTTP_TIMEOUT_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|v| v.clamp(250, 15_000))
        .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)
}

fn load_targets() -> WebhookTargets {
    WebhookTargets {
        discord_webhook_url: std::env::var("DISCORD_WEBHOOK_URL").ok(),
        telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
        telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
        timeout_ms: load_timeout_ms(),
    }
}

fn targets_enabled(targets: &WebhookTargets) -> bool {
    let has_discord = targets
        .discord_webhook_url
        .as_deref()
        .is_some_and(|v| !v.trim().is_empty());
    let has_telegram = targets
        .telegram_bot_token
        .as_deref()
        .is_some_and(|v| !v.trim().is_empty())
        && targets
            .telegram_chat_id
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty());
    has_discord || has_telegram
}

fn fmt_level(level: TelemetryLevel) -> &'static str {
    match level {
        TelemetryLevel::Info => "INFO",
        TelemetryLevel::Success => "SUCCESS",
        TelemetryLevel::Critical => "CRITICAL",
    }
}

fn render_message(event: &TelemetryEvent) -> String {
    let mut msg = format!(
        "[RELAY][{}] {}: {}",
        fmt_level(event.level),
        event.kind,
        event.message
    );
    if let Some(details) = &event.details {
        msg.push_str(" | details=");
        msg.push_str(&details.to_string());
    }
    msg.push_str(&format!(" (ts_ms={})", event.ts_ms));
    msg
}

fn send_discord(client: &reqwest::blocking::Client, webhook_url: &str, event: &TelemetryEvent) {
    let payload = serde_json::json!({
        "content": render_message(event),
    });
    let _ = client.post(webhook_url).json(&payload).send();
}

fn send_telegram(
    client: &reqwest::blocking::Client,
    bot_token: &str,
    chat_id: &str,
    event: &TelemetryEvent,
) {
    let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
    let payload = serde_json::json!({
        "chat_id": chat_id,
        "text": render_message(event),
        "disable_web_page_preview": true,
    });
    let _ = client.post(url).json(&payload).send();
}

fn spawn_worker(targets: WebhookTargets) -> SyncSender<TelemetryEvent> {
    let (tx, rx) = sync_channel::<TelemetryEvent>(load_queue_capacity());
    std::thread::spawn(move || {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(targets.timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        while let Ok(event) = rx.recv() {
            if let Some(url) = targets.discord_webhook_url.as_deref() {
                send_discord(&client, url, &event);
            }
            if let (Some(token), Some(chat_id)) = (
                targets.telegram_bot_token.as_deref(),
                targets.telegram_chat_id.as_deref(),
            ) {
                send_telegram(&client, token, chat_id, &event);
            }
        }
    });
    tx
}

pub fn init_telemetry() {
    if TELEMETRY_SENDER.get().is_some() {
        return;
    }
    let guard = TELEMETRY_INIT_GUARD.get_or_init(|| Mutex::new(()));
    let _guard = match guard.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    if TELEMETRY_SENDER.get().is_some() {
        return;
    }
    let targets = load_targets();
    if !targets_enabled(&targets) {
        return;
    }
    let tx = spawn_worker(targets);
    let _ = TELEMETRY_SENDER.set(tx);
}

pub fn emit(level: TelemetryLevel, kind: impl Into<String>, message: impl Into<String>) {
    emit_with_details(level, kind, message, None);
}

/// Queues one event; a full queue drops the event rather than blocking the
/// caller.
pub fn emit_with_details(
    level: TelemetryLevel,
    kind: impl Into<String>,
    message: impl Into<String>,
    details: Option<Value>,
) {
    if TELEMETRY_SENDER.get().is_none() {
        init_telemetry();
    }
    let Some(sender) = TELEMETRY_SENDER.get() else {
        return;
    };

    let event = TelemetryEvent {
        ts_ms: now_ms(),
        level,
        kind: kind.into(),
        message: message.into(),
        details,
    };
    match sender.try_send(event) {
        Ok(_) => {}
        Err(TrySendError::Full(_)) => {}
        Err(TrySendError::Disconnected(_)) => {}
    }
}

pub fn emit_success(kind: impl Into<String>, message: impl Into<String>) {
    emit(TelemetryLevel::Success, kind, message);
}

pub fn emit_critical(kind: impl Into<String>, message: impl Into<String>) {
    emit(TelemetryLevel::Critical, kind, message);
}

/// Chains a panic hook that pushes the panic message to the alert channels
/// before the previous hook runs.
pub fn install_panic_hook_once() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    if INSTALLED.get().is_some() {
        return;
    }
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        emit_critical(
            "panic",
            crate::utils::error::compact_error_message(&panic_info.to_string()),
        );
        previous(panic_info);
    }));
    let _ = INSTALLED.set(());
}
