//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DocketSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `DOCKET_*` environment variable overrides
//! 4. [`DocketSettings::validate`]
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::DocketSettings;

/// Resolve the default settings file path (`~/.docket/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".docket").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DocketSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or a value that fails
/// validation is an error.
pub fn load_settings_from_path(path: &Path) -> Result<DocketSettings> {
    let defaults = serde_json::to_value(DocketSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DocketSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `DOCKET_*` environment variable overrides.
///
/// Invalid values are ignored with a warning (falling back to file/default).
pub fn apply_env_overrides(settings: &mut DocketSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary variable lookup.
///
/// Split out from [`apply_env_overrides`] so tests do not mutate the
/// process environment.
pub fn apply_overrides_from(
    settings: &mut DocketSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("DOCKET_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("DOCKET_PORT") {
        match v.parse::<u16>() {
            Ok(port) => settings.server.port = port,
            Err(_) => warn!(key = "DOCKET_PORT", value = %v, "invalid port env var, ignoring"),
        }
    }
    if let Some(v) = read("DOCKET_RETENTION_MAX_EVENTS") {
        if let Some(n) = parse_u64_range(&v, 1, 10_000_000) {
            settings.stream.retention_max_events = n as usize;
        } else {
            warn!(key = "DOCKET_RETENTION_MAX_EVENTS", value = %v, "invalid integer env var, ignoring");
        }
    }
    if let Some(v) = read("DOCKET_RETENTION_MAX_AGE_SECS") {
        if let Some(n) = parse_u64_range(&v, 1, 7 * 24 * 3600) {
            settings.stream.retention_max_age_secs = n;
        } else {
            warn!(key = "DOCKET_RETENTION_MAX_AGE_SECS", value = %v, "invalid integer env var, ignoring");
        }
    }
    if let Some(v) = read("DOCKET_KEEPALIVE_INTERVAL_MS") {
        if let Some(n) = parse_u64_range(&v, 100, 600_000) {
            settings.keepalive.interval_ms = n;
        } else {
            warn!(key = "DOCKET_KEEPALIVE_INTERVAL_MS", value = %v, "invalid integer env var, ignoring");
        }
    }
    if let Some(v) = read("DOCKET_GRACE_PERIOD_MS") {
        if let Some(n) = parse_u64_range(&v, 0, 3_600_000) {
            settings.keepalive.grace_period_ms = n;
        } else {
            warn!(key = "DOCKET_GRACE_PERIOD_MS", value = %v, "invalid integer env var, ignoring");
        }
    }
    if let Some(v) = read("DOCKET_MOCK_MODE") {
        if let Some(b) = parse_bool(&v) {
            settings.stream.mock_mode = b;
        } else {
            warn!(key = "DOCKET_MOCK_MODE", value = %v, "invalid boolean env var, ignoring");
        }
    }
    if let Some(v) = read("DOCKET_WATERMARK_DB") {
        settings.stream.watermark_db = Some(v);
    }
    if let Some(v) = read("DOCKET_JWT_SECRET") {
        settings.admission.jwt_secret = Some(v);
    }
    if let Some(v) = read("DOCKET_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
