//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RtmSettings {
    /// Listener and transport settings.
    pub server: ServerSettings,
    /// Per-connection worker pool.
    pub executor: ExecutorSettings,
    /// Process-wide shutdown.
    pub shutdown: ShutdownSettings,
    /// `WAIT_PENDING` flow control.
    pub flow_control: FlowControlSettings,
    /// Handshake authentication.
    pub auth: AuthSettings,
    /// Registration table verification.
    pub dispatch: DispatchSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RtmSettings {
    /// Reject values the broker cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.max_workers == 0 {
            return Err(SettingsError::InvalidValue(
                "executor.maxWorkers must be at least 1".into(),
            ));
        }
        if self.server.max_message_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxMessageSize must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be at least 1".into(),
            ));
        }
        if self.flow_control.default_wait_ms > self.flow_control.max_wait_ms {
            return Err(SettingsError::InvalidValue(
                "flowControl.defaultWaitMs must not exceed flowControl.maxWaitMs".into(),
            ));
        }
        if self.auth.require_token && self.auth.jwt_secret.is_none() {
            return Err(SettingsError::InvalidValue(
                "auth.requireToken needs auth.jwtSecret".into(),
            ));
        }
        Ok(())
    }
}

/// Listener and transport-level limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` = auto-assign).
    pub port: u16,
    /// Maximum live connections; further upgrades are refused.
    pub max_connections: usize,
    /// Maximum single-message size in bytes.
    pub max_message_size: usize,
    /// Close connections silent for this long.
    pub idle_timeout_ms: u64,
    /// Ping interval.
    pub heartbeat_interval_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9850,
            max_connections: 1000,
            max_message_size: 1024 * 1024,
            idle_timeout_ms: 120_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

/// Per-connection worker pool.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutorSettings {
    /// Maximum concurrently running units of work per connection.
    pub max_workers: usize,
    /// Drain budget when a connection closes on its own.
    pub close_drain_timeout_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_workers: 5,
            close_drain_timeout_ms: 5_000,
        }
    }
}

impl ExecutorSettings {
    /// Close drain budget as a `Duration`.
    pub fn close_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.close_drain_timeout_ms)
    }
}

/// Process-wide shutdown.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownSettings {
    /// Per-connection drain budget during process shutdown.
    pub drain_timeout_ms: u64,
    /// Reason sent with the final `going away` close.
    pub close_reason: String,
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
            close_reason: "Server shutting down".to_string(),
        }
    }
}

impl ShutdownSettings {
    /// Drain budget as a `Duration`.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// `WAIT_PENDING` bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowControlSettings {
    /// Wait used when a message omits `waitMs`.
    pub default_wait_ms: u64,
    /// Upper bound for any client-requested wait.
    pub max_wait_ms: u64,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            default_wait_ms: 5_000,
            max_wait_ms: 30_000,
        }
    }
}

/// Handshake authentication.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Refuse connections without a valid token.
    pub require_token: bool,
    /// HS256 secret used to verify bearer tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Required `iss` claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// Registration table verification.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Fail startup when a type has a handler but no authorizer (or vice versa).
    pub strict_registry: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            strict_registry: true,
        }
    }
}

/// Log output.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (overridden by `RUST_LOG`).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
