//! Gateway settings.
//!
//! Loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over the defaults
//! 3. **Environment variables**: `RELAY_*` overrides
//!
//! Durations are stored in milliseconds and converted into the component
//! configs by the accessor methods.

mod loader;

use std::time::Duration;

use relay_core::monitor::PoolType;
use relay_core::ChannelId;
use relay_engine::{OrchestratorConfig, PresenceConfig, ProcessorConfig, WorkerPoolConfig};
use relay_store::{BackendConfig, LockConfig, MonitoringConfig, StoreOptions, TypingConfig};
use relay_telemetry::{LogFormat, TelemetryConfig};
use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

pub use loader::{apply_env_overrides, apply_overrides, deep_merge, load_settings, parse_u64_range};

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub session: SessionSettings,
    pub presence: PresenceSettings,
    pub workers: WorkerSettings,
    pub logging: LoggingSettings,
}

/// Process identity, heartbeat and the admin listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Fixed server id. Generated at startup when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub admin_host: String,
    /// Admin router port; `0` picks a free port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_port: Option<u16>,
    pub heartbeat_interval_ms: u64,
    /// Channels registered at startup.
    pub channels: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_id: None,
            admin_host: "127.0.0.1".to_string(),
            admin_port: None,
            heartbeat_interval_ms: 30_000,
            channels: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub backend: BackendConfig,
    pub namespace: String,
    pub sweep_interval_ms: u64,
    pub lock_ttl_ms: u64,
    pub lock_max_attempts: u32,
    pub lock_retry_wait_ms: u64,
    pub lock_jitter_ms: u64,
    pub typing_ttl_ms: u64,
    pub server_staleness_ms: u64,
    pub worker_idle_ttl_ms: u64,
    pub monitor_record_ttl_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Memory,
            namespace: "relay".to_string(),
            sweep_interval_ms: 30_000,
            lock_ttl_ms: 2_000,
            lock_max_attempts: 50,
            lock_retry_wait_ms: 40,
            lock_jitter_ms: 40,
            typing_ttl_ms: 20_000,
            server_staleness_ms: 60_000,
            worker_idle_ttl_ms: 120_000,
            monitor_record_ttl_ms: 600_000,
        }
    }
}

/// Debounce and lifecycle of conversations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub debounce_ms: u64,
    pub inactivity_timeout_ms: u64,
    /// How long before the inactivity close the warning fires; `0` disables it.
    pub warn_offset_ms: u64,
    pub session_ttl_ms: u64,
    pub max_typing_deferrals: u32,
    pub memory_turns: usize,
    pub reply_timeout_ms: u64,
    pub wait_idle_timeout_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_text: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 3_000,
            inactivity_timeout_ms: 600_000,
            warn_offset_ms: 60_000,
            session_ttl_ms: 1_800_000,
            max_typing_deferrals: 3,
            memory_turns: 20,
            reply_timeout_ms: 120_000,
            wait_idle_timeout_ms: 5_000,
            warning_text: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresenceSettings {
    pub wake_period_ms: u64,
    pub settle_window_ms: u64,
    pub record_ttl_ms: u64,
}

impl Default for PresenceSettings {
    fn default() -> Self {
        Self {
            wake_period_ms: 15 * 60_000,
            settle_window_ms: 60_000,
            record_ttl_ms: 7 * 24 * 3_600_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerSettings {
    pub processing_workers: u32,
    pub outbound_workers: u32,
    pub queue_capacity: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            processing_workers: 8,
            outbound_workers: 2,
            queue_capacity: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,
    /// `json` or `pretty`.
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl RelaySettings {
    /// Reject combinations the components cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let session = &self.session;
        if session.debounce_ms == 0 {
            return Err(SettingsError::InvalidValue("session.debounceMs must be positive".into()));
        }
        if session.inactivity_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "session.inactivityTimeoutMs must be positive".into(),
            ));
        }
        if session.warn_offset_ms >= session.inactivity_timeout_ms {
            return Err(SettingsError::InvalidValue(format!(
                "session.warnOffsetMs ({}) must be below session.inactivityTimeoutMs ({})",
                session.warn_offset_ms, session.inactivity_timeout_ms
            )));
        }
        if self.store.lock_max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "store.lockMaxAttempts must be positive".into(),
            ));
        }
        if self.store.namespace.is_empty() {
            return Err(SettingsError::InvalidValue("store.namespace must not be empty".into()));
        }
        if self.workers.processing_workers == 0 || self.workers.outbound_workers == 0 {
            return Err(SettingsError::InvalidValue("worker counts must be positive".into()));
        }
        for channel in &self.server.channels {
            ChannelId::from_raw(channel.as_str())
                .validate()
                .map_err(|e| SettingsError::InvalidValue(format!("server.channels: {e}")))?;
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(SettingsError::InvalidValue(format!(
                "unknown log level: {}",
                self.logging.level
            )));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        ms(self.server.heartbeat_interval_ms)
    }

    pub fn store_options(&self) -> StoreOptions {
        let s = &self.store;
        StoreOptions {
            namespace: s.namespace.clone(),
            lock: LockConfig {
                ttl: ms(s.lock_ttl_ms),
                max_attempts: s.lock_max_attempts,
                retry_wait: ms(s.lock_retry_wait_ms),
                jitter: ms(s.lock_jitter_ms),
            },
            typing: TypingConfig {
                ttl: ms(s.typing_ttl_ms),
            },
            monitoring: MonitoringConfig {
                server_staleness: ms(s.server_staleness_ms),
                worker_idle_ttl: ms(s.worker_idle_ttl_ms),
                record_ttl: ms(s.monitor_record_ttl_ms),
            },
            sweep_interval: ms(s.sweep_interval_ms),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let s = &self.session;
        OrchestratorConfig {
            debounce: ms(s.debounce_ms),
            inactivity_timeout: ms(s.inactivity_timeout_ms),
            warn_offset: ms(s.warn_offset_ms),
            session_ttl: ms(s.session_ttl_ms),
            max_typing_deferrals: s.max_typing_deferrals,
        }
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        let s = &self.session;
        ProcessorConfig {
            memory_turns: s.memory_turns,
            wait_idle_timeout: ms(s.wait_idle_timeout_ms),
            reply_timeout: ms(s.reply_timeout_ms),
            warning_text: s.warning_text.clone(),
        }
    }

    pub fn presence_config(&self) -> PresenceConfig {
        let p = &self.presence;
        PresenceConfig {
            wake_period: ms(p.wake_period_ms),
            settle_window: ms(p.settle_window_ms),
            record_ttl: ms(p.record_ttl_ms),
        }
    }

    pub fn pool_config(&self, pool: PoolType) -> WorkerPoolConfig {
        let workers = match pool {
            PoolType::Processing => self.workers.processing_workers,
            PoolType::Outbound => self.workers.outbound_workers,
        };
        WorkerPoolConfig {
            pool,
            workers,
            queue_capacity: self.workers.queue_capacity,
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_level: self.logging.level.parse().unwrap_or(tracing::Level::INFO),
            module_levels: Vec::new(),
            format: match self.logging.format.as_str() {
                "pretty" => LogFormat::Pretty,
                _ => LogFormat::Json,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_defaults() {
        let s = RelaySettings::default();
        s.validate().unwrap();
        let orch = s.orchestrator_config();
        let defaults = OrchestratorConfig::default();
        assert_eq!(orch.debounce, defaults.debounce);
        assert_eq!(orch.inactivity_timeout, defaults.inactivity_timeout);
        assert_eq!(orch.warn_offset, defaults.warn_offset);
        assert_eq!(orch.session_ttl, defaults.session_ttl);

        let store = s.store_options();
        assert_eq!(store.lock.ttl, LockConfig::default().ttl);
        assert_eq!(store.lock.max_attempts, 50);
        assert_eq!(store.typing.ttl, Duration::from_secs(20));
        assert_eq!(store.monitoring.worker_idle_ttl, Duration::from_secs(120));
        assert_eq!(s.presence_config().wake_period, Duration::from_secs(900));
        assert_eq!(s.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(RelaySettings::default()).unwrap();
        assert_eq!(json["session"]["debounceMs"], 3000);
        assert_eq!(json["store"]["backend"]["kind"], "memory");
        assert!(json["server"].get("serverId").is_none());
    }

    #[test]
    fn warn_offset_must_be_below_timeout() {
        let mut s = RelaySettings::default();
        s.session.warn_offset_ms = s.session.inactivity_timeout_ms;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("warnOffsetMs"));
        s.session.warn_offset_ms = 0;
        s.validate().unwrap();
    }

    #[test]
    fn rejects_unknown_log_level_and_zero_workers() {
        let mut s = RelaySettings::default();
        s.logging.level = "loud".into();
        assert!(s.validate().is_err());
        let mut s = RelaySettings::default();
        s.workers.outbound_workers = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn rejects_channel_with_key_separator() {
        let mut s = RelaySettings::default();
        s.server.channels = vec!["chanA".into(), "chan|B".into()];
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("chan|B"));
        s.server.channels.pop();
        s.validate().unwrap();
    }

    #[test]
    fn pool_configs_per_type() {
        let mut s = RelaySettings::default();
        s.workers.processing_workers = 3;
        let p = s.pool_config(PoolType::Processing);
        assert_eq!(p.workers, 3);
        assert_eq!(p.pool, PoolType::Processing);
        assert_eq!(s.pool_config(PoolType::Outbound).workers, 2);
    }

    #[test]
    fn telemetry_from_logging() {
        let mut s = RelaySettings::default();
        s.logging.level = "debug".into();
        s.logging.format = "pretty".into();
        let t = s.telemetry_config();
        assert_eq!(t.log_level, tracing::Level::DEBUG);
        assert_eq!(t.format, LogFormat::Pretty);
    }
}
