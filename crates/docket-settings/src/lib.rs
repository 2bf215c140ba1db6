//! # docket-settings
//!
//! Configuration for the docket streaming server, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults** — [`DocketSettings::default()`]
//! 2. **Settings file** — `~/.docket/settings.json` or an explicit path
//!    (deep-merged over defaults)
//! 3. **Environment variables** — `DOCKET_*` overrides (highest priority)
//!
//! Every timeout the streaming core relies on (handshake, keepalive
//! interval, missed-heartbeat threshold, degraded grace period) is an
//! explicit field here; nothing is implicit.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
