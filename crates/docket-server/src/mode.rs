//! Live/mock mode selection.
//!
//! A session's mode is resolved the first time any connection attaches to
//! it and then stays fixed until the session is disposed or swept as idle.
//! Later requests for a different mode are ignored, so a session never
//! switches mid-stream.

use std::sync::Arc;

use dashmap::DashMap;
use docket_core::SessionId;
use docket_events::MockScript;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Where a session's envelopes come from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// The live core fed by the producer.
    Live,
    /// The deterministic canned script.
    Mock,
}

impl StreamMode {
    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Mock => "mock",
        }
    }

    /// Parse a query value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Some(Self::Live),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

/// Resolves and pins the mode of each session.
#[derive(Debug)]
pub struct ModeSelector {
    default: StreamMode,
    resolved: DashMap<SessionId, StreamMode>,
    scripts: DashMap<SessionId, Arc<MockScript>>,
}

impl ModeSelector {
    /// Selector falling back to `default` when a client states no preference.
    pub fn new(default: StreamMode) -> Self {
        Self {
            default,
            resolved: DashMap::new(),
            scripts: DashMap::new(),
        }
    }

    /// The session's mode, resolving it now if this is the first connection.
    pub fn resolve(&self, session_id: &SessionId, requested: Option<StreamMode>) -> StreamMode {
        let mode = *self
            .resolved
            .entry(session_id.clone())
            .or_insert_with(|| {
                let mode = requested.unwrap_or(self.default);
                info!(session_id = %session_id, mode = mode.as_str(), "session mode resolved");
                mode
            });
        if let Some(requested) = requested.filter(|r| *r != mode) {
            debug!(
                session_id = %session_id,
                requested = requested.as_str(),
                pinned = mode.as_str(),
                "ignoring mode request for already-resolved session"
            );
        }
        mode
    }

    /// Pinned mode, if resolved.
    pub fn get(&self, session_id: &SessionId) -> Option<StreamMode> {
        self.resolved.get(session_id).map(|m| *m)
    }

    /// The canned script for a mock session, built once and shared.
    pub fn mock_script(&self, session_id: &SessionId) -> Arc<MockScript> {
        Arc::clone(
            &self
                .scripts
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(MockScript::standard(session_id))),
        )
    }

    /// Drop the session's pinned mode and script.
    pub fn forget(&self, session_id: &SessionId) {
        let _ = self.resolved.remove(session_id);
        let _ = self.scripts.remove(session_id);
    }

    /// Forget every session `keep` rejects. Returns how many were dropped.
    pub fn retain(&self, keep: impl Fn(&SessionId) -> bool) -> usize {
        let before = self.resolved.len();
        self.resolved.retain(|session_id, _| keep(session_id));
        self.scripts.retain(|session_id, _| keep(session_id));
        before.saturating_sub(self.resolved.len())
    }

    /// Number of sessions with a pinned mode.
    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    /// Whether no session has a pinned mode.
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}
