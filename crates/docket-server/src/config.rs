//! Server configuration.

use std::time::Duration;

use docket_events::{RetentionPolicy, StreamConfig};
use docket_settings::DocketSettings;

use crate::mode::StreamMode;

/// How often idle per-session state is swept.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Connection liveness timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Interval between server heartbeats.
    pub interval: Duration,
    /// Consecutive silent intervals before DEGRADED.
    pub missed_threshold: u32,
    /// How long DEGRADED may last before CLOSED.
    pub grace_period: Duration,
    /// Bound on the post-upgrade handshake.
    pub handshake_timeout: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            missed_threshold: 3,
            grace_period: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Runtime configuration for the docket server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent streaming connections.
    pub max_connections: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Keepalive timing.
    pub keepalive: KeepaliveConfig,
    /// Session stream parameters.
    pub stream: StreamConfig,
    /// Mode for sessions whose first client expresses no preference.
    pub default_mode: StreamMode,
    /// Interval of the idle-state sweep.
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &DocketSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            max_message_size: settings.server.max_message_size,
            keepalive: KeepaliveConfig {
                interval: settings.keepalive.interval(),
                missed_threshold: settings.keepalive.missed_threshold,
                grace_period: settings.keepalive.grace_period(),
                handshake_timeout: settings.keepalive.handshake_timeout(),
            },
            stream: StreamConfig {
                retention: RetentionPolicy {
                    max_events: settings.stream.retention_max_events,
                    max_age: settings.stream.retention_max_age(),
                },
                subscriber_capacity: settings.stream.subscriber_capacity,
            },
            default_mode: if settings.stream.mock_mode {
                StreamMode::Mock
            } else {
                StreamMode::Live
            },
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            ..Self::from_settings(&DocketSettings::default())
        }
    }
}
