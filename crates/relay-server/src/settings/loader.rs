//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use relay_store::BackendConfig;
use serde_json::Value;
use tracing::{debug, warn};

use super::RelaySettings;
use crate::error::SettingsError;

/// Load settings from an optional file, then apply `RELAY_*` overrides.
///
/// A missing file yields the defaults; a file with invalid JSON is an error.
pub fn load_settings(path: Option<&Path>) -> Result<RelaySettings, SettingsError> {
    let defaults = serde_json::to_value(RelaySettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: RelaySettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut RelaySettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply `RELAY_*` overrides read through `lookup`.
///
/// Numbers must parse and fall within their range; invalid values are
/// ignored with a warning and the file/default value stays.
pub fn apply_overrides(settings: &mut RelaySettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = Env { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_SERVER_ID") {
        settings.server.server_id = Some(v);
    }
    if let Some(v) = env.string("RELAY_ADMIN_HOST") {
        settings.server.admin_host = v;
    }
    if let Some(v) = env.u64("RELAY_ADMIN_PORT", 0, 65535) {
        settings.server.admin_port = u16::try_from(v).ok();
    }
    if let Some(v) = env.u64("RELAY_HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.string("RELAY_CHANNELS") {
        settings.server.channels = v
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_NAMESPACE") {
        settings.store.namespace = v;
    }
    if let Some(kind) = env.string("RELAY_BACKEND") {
        match kind.to_lowercase().as_str() {
            "memory" => settings.store.backend = BackendConfig::Memory,
            "sqlite" => {
                let path = env
                    .string("RELAY_SQLITE_PATH")
                    .map(PathBuf::from)
                    .or_else(|| match &settings.store.backend {
                        BackendConfig::Sqlite { path } => Some(path.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| PathBuf::from("relay.db"));
                settings.store.backend = BackendConfig::Sqlite { path };
            }
            "redis" => {
                let url = env
                    .string("RELAY_REDIS_URL")
                    .or_else(|| match &settings.store.backend {
                        BackendConfig::Redis { url } => Some(url.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
                settings.store.backend = BackendConfig::Redis { url };
            }
            other => warn!(key = "RELAY_BACKEND", value = %other, "unknown backend, ignoring"),
        }
    }
    if let Some(v) = env.u64("RELAY_LOCK_TTL_MS", 100, 60_000) {
        settings.store.lock_ttl_ms = v;
    }
    if let Some(v) = env.u64("RELAY_LOCK_MAX_ATTEMPTS", 1, 10_000) {
        settings.store.lock_max_attempts = v as u32;
    }
    if let Some(v) = env.u64("RELAY_TYPING_TTL_MS", 1_000, 600_000) {
        settings.store.typing_ttl_ms = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("RELAY_DEBOUNCE_MS", 1, 600_000) {
        settings.session.debounce_ms = v;
    }
    if let Some(v) = env.u64("RELAY_INACTIVITY_TIMEOUT_MS", 1_000, 86_400_000) {
        settings.session.inactivity_timeout_ms = v;
    }
    if let Some(v) = env.u64("RELAY_WARN_OFFSET_MS", 0, 86_400_000) {
        settings.session.warn_offset_ms = v;
    }
    if let Some(v) = env.u64("RELAY_SESSION_TTL_MS", 1_000, 604_800_000) {
        settings.session.session_ttl_ms = v;
    }
    if let Some(v) = env.u64("RELAY_REPLY_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.session.reply_timeout_ms = v;
    }
    if let Some(v) = env.string("RELAY_WARNING_TEXT") {
        settings.session.warning_text = Some(v);
    }

    // ── Presence ────────────────────────────────────────────────────
    if let Some(v) = env.u64("RELAY_WAKE_PERIOD_MS", 1_000, 86_400_000) {
        settings.presence.wake_period_ms = v;
    }
    if let Some(v) = env.u64("RELAY_SETTLE_WINDOW_MS", 100, 3_600_000) {
        settings.presence.settle_window_ms = v;
    }

    // ── Workers ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("RELAY_PROCESSING_WORKERS", 1, 1_024) {
        settings.workers.processing_workers = v as u32;
    }
    if let Some(v) = env.u64("RELAY_OUTBOUND_WORKERS", 1, 1_024) {
        settings.workers.outbound_workers = v as u32;
    }
    if let Some(v) = env.u64("RELAY_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.workers.queue_capacity = v as usize;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("RELAY_LOG_LEVEL") {
        if v.parse::<tracing::Level>().is_ok() {
            settings.logging.level = v.to_lowercase();
        } else {
            warn!(key = "RELAY_LOG_LEVEL", value = %v, "invalid log level, ignoring");
        }
    }
    if let Some(v) = env.string("RELAY_LOG_FORMAT") {
        match v.as_str() {
            "json" | "pretty" => settings.logging.format = v,
            _ => warn!(key = "RELAY_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid numeric env var, ignoring");
        }
        result
    }
}
