//! Server runtime configuration.

use std::time::Duration;

use rtm_settings::RtmSettings;
use serde::{Deserialize, Serialize};

/// Configuration for the RTM server, derived from [`RtmSettings`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Maximum live connections.
    pub max_connections: usize,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
    /// Ping interval.
    pub heartbeat_interval: Duration,
    /// Close connections silent for this long.
    pub idle_timeout: Duration,
    /// Maximum concurrently running units of work per connection.
    pub max_workers: usize,
    /// Drain budget when a connection closes on its own.
    pub close_drain_timeout: Duration,
    /// Per-connection drain budget during process shutdown.
    pub shutdown_drain_timeout: Duration,
    /// Reason sent with the final `going away` close.
    pub shutdown_reason: String,
    /// `WAIT_PENDING` wait when the message omits one.
    pub default_wait: Duration,
    /// Upper bound for client-requested waits.
    pub max_wait: Duration,
    /// Fail construction when the registration table is incomplete.
    pub strict_registry: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let mut config = Self::from(&RtmSettings::default());
        config.host = "127.0.0.1".into();
        config.port = 0;
        config
    }
}

impl From<&RtmSettings> for ServerConfig {
    fn from(settings: &RtmSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            max_message_size: settings.server.max_message_size,
            heartbeat_interval: Duration::from_millis(settings.server.heartbeat_interval_ms),
            idle_timeout: Duration::from_millis(settings.server.idle_timeout_ms),
            max_workers: settings.executor.max_workers,
            close_drain_timeout: settings.executor.close_drain_timeout(),
            shutdown_drain_timeout: settings.shutdown.drain_timeout(),
            shutdown_reason: settings.shutdown.close_reason.clone(),
            default_wait: Duration::from_millis(settings.flow_control.default_wait_ms),
            max_wait: Duration::from_millis(settings.flow_control.max_wait_ms),
            strict_registry: settings.dispatch.strict_registry,
        }
    }
}
