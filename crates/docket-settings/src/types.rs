//! Settings type definitions.
//!
//! All types use camelCase JSON field names and `#[serde(default)]`, so a
//! settings file only needs the keys it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocketSettings {
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Retention and fan-out settings for session streams.
    pub stream: StreamSettings,
    /// Connection liveness timing.
    pub keepalive: KeepaliveSettings,
    /// Admission pipeline (auth, rate limit, version check).
    pub admission: AdmissionSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl DocketSettings {
    /// Reject values the streaming core cannot run with.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(SettingsError::InvalidValue(msg.to_owned()))
        }
        if self.stream.retention_max_events == 0 {
            return invalid("stream.retentionMaxEvents must be > 0");
        }
        if self.stream.retention_max_age_secs == 0 {
            return invalid("stream.retentionMaxAgeSecs must be > 0");
        }
        if self.stream.subscriber_capacity == 0 {
            return invalid("stream.subscriberCapacity must be > 0");
        }
        if self.keepalive.interval_ms == 0 {
            return invalid("keepalive.intervalMs must be > 0");
        }
        if self.keepalive.missed_threshold == 0 {
            return invalid("keepalive.missedThreshold must be > 0");
        }
        if self.keepalive.handshake_timeout_ms == 0 {
            return invalid("keepalive.handshakeTimeoutMs must be > 0");
        }
        if self.admission.supported_versions.is_empty() {
            return invalid("admission.supportedVersions must not be empty");
        }
        if self.admission.rate_limit.capacity == 0 {
            return invalid("admission.rateLimit.capacity must be > 0");
        }
        if !(self.admission.rate_limit.refill_per_sec.is_finite()
            && self.admission.rate_limit.refill_per_sec > 0.0)
        {
            return invalid("admission.rateLimit.refillPerSec must be a positive number");
        }
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent streaming connections.
    pub max_connections: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8470,
            max_connections: 512,
            max_message_size: 64 * 1024,
        }
    }
}

/// Retention window and fan-out settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Maximum envelopes retained per session for replay.
    pub retention_max_events: usize,
    /// Maximum age of a retained envelope, in seconds.
    pub retention_max_age_secs: u64,
    /// Capacity of each connection's live queue before it is detached as lagging.
    pub subscriber_capacity: usize,
    /// Optional `SQLite` file persisting sequence high-water marks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark_db: Option<String>,
    /// Serve the deterministic mock stream to sessions by default.
    pub mock_mode: bool,
}

impl StreamSettings {
    /// Maximum retention age as a [`Duration`].
    pub fn retention_max_age(&self) -> Duration {
        Duration::from_secs(self.retention_max_age_secs)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            retention_max_events: 1000,
            retention_max_age_secs: 900,
            subscriber_capacity: 256,
            watermark_db: None,
            mock_mode: false,
        }
    }
}

/// Connection liveness timing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepaliveSettings {
    /// Interval between server heartbeats, in milliseconds.
    pub interval_ms: u64,
    /// Consecutive silent intervals before a connection is marked degraded.
    pub missed_threshold: u32,
    /// How long a degraded connection may stay degraded before it is closed.
    pub grace_period_ms: u64,
    /// Upper bound on the admission handshake.
    pub handshake_timeout_ms: u64,
}

impl KeepaliveSettings {
    /// Heartbeat interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Degraded grace period.
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Handshake bound.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            missed_threshold: 3,
            grace_period_ms: 60_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

/// A static bearer token and the subject it authenticates as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticToken {
    /// The bearer token.
    pub token: String,
    /// Identity subject the token maps to.
    pub subject: String,
}

/// Token bucket parameters, applied per identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// Bucket size (burst).
    pub capacity: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 1.0,
        }
    }
}

/// Admission pipeline settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdmissionSettings {
    /// Static bearer tokens.
    pub tokens: Vec<StaticToken>,
    /// HS256 secret for signed session tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    /// Per-identity connection rate limit.
    pub rate_limit: RateLimitSettings,
    /// Protocol versions this server can serve.
    pub supported_versions: Vec<u32>,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            jwt_secret: None,
            rate_limit: RateLimitSettings::default(),
            supported_versions: vec![1, 2],
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DocketSettings::default().validate().unwrap();
    }

    #[test]
    fn default_retention() {
        let s = StreamSettings::default();
        assert_eq!(s.retention_max_events, 1000);
        assert_eq!(s.retention_max_age(), Duration::from_secs(900));
        assert!(!s.mock_mode);
    }

    #[test]
    fn default_keepalive_durations() {
        let k = KeepaliveSettings::default();
        assert_eq!(k.interval(), Duration::from_secs(15));
        assert_eq!(k.grace_period(), Duration::from_secs(60));
        assert_eq!(k.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(k.missed_threshold, 3);
    }

    #[test]
    fn default_supported_versions() {
        assert_eq!(AdmissionSettings::default().supported_versions, vec![1, 2]);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{"stream":{"retentionMaxEvents":20},"admission":{"tokens":[{"token":"t","subject":"alice"}]}}"#;
        let s: DocketSettings = serde_json::from_str(json).unwrap();
        assert_eq!(s.stream.retention_max_events, 20);
        assert_eq!(s.stream.retention_max_age_secs, 900);
        assert_eq!(s.admission.tokens[0].subject, "alice");
        assert_eq!(s.keepalive.interval_ms, 15_000);
    }

    #[test]
    fn camel_case_on_the_wire() {
        let json = serde_json::to_value(DocketSettings::default()).unwrap();
        assert!(json["stream"].get("retentionMaxEvents").is_some());
        assert!(json["keepalive"].get("gracePeriodMs").is_some());
        assert!(json["admission"]["rateLimit"].get("refillPerSec").is_some());
        assert!(json["stream"].get("watermarkDb").is_none());
    }

    #[test]
    fn validate_rejects_zero_retention() {
        let mut s = DocketSettings::default();
        s.stream.retention_max_events = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("retentionMaxEvents"));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut s = DocketSettings::default();
        s.keepalive.interval_ms = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_versions() {
        let mut s = DocketSettings::default();
        s.admission.supported_versions.clear();
        assert!(s.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_refill() {
        let mut s = DocketSettings::default();
        s.admission.rate_limit.refill_per_sec = f64::NAN;
        assert!(s.validate().is_err());
        s.admission.rate_limit.refill_per_sec = 0.0;
        assert!(s.validate().is_err());
    }
}
