//! Producer-facing entry point.
//!
//! [`StreamHub`] maps session IDs to their [`SessionStream`]s, creating
//! them on first use. Producers only ever call [`StreamHub::emit`]; they
//! never see sequence numbers or buffers. Each session is independently
//! constructible and disposable; there is no ambient global state.
//!
//! Terminated streams leave the map as soon as the hub sees them, and
//! [`StreamHub::sweep_dormant`] drops streams that hold nothing worth
//! keeping. A later touch rebuilds the stream from its watermark.

use std::collections::HashMap;
use std::sync::Arc;

use docket_core::SessionId;
use metrics::gauge;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::buffer::RetentionPolicy;
use crate::envelope::{EventEnvelope, EventType};
use crate::errors::{Result, StreamError};
use crate::sequence::SequenceGenerator;
use crate::stream::{ResyncRequest, SessionStream};
use crate::watermark::WatermarkStore;

/// Capacity of the resync notification channel.
const RESYNC_CHANNEL_CAPACITY: usize = 256;

/// Hub-wide stream parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Retention bounds applied to every session buffer.
    pub retention: RetentionPolicy,
    /// Live queue capacity per attached connection.
    pub subscriber_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retention: RetentionPolicy::default(),
            subscriber_capacity: 256,
        }
    }
}

/// Registry of live session streams.
pub struct StreamHub {
    config: StreamConfig,
    generator: Arc<SequenceGenerator>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionStream>>>,
    resync_tx: broadcast::Sender<ResyncRequest>,
}

impl StreamHub {
    /// Hub persisting high-water marks in `store`.
    pub fn new(config: StreamConfig, store: Arc<dyn WatermarkStore>) -> Self {
        let (resync_tx, _) = broadcast::channel(RESYNC_CHANNEL_CAPACITY);
        Self {
            config,
            generator: Arc::new(SequenceGenerator::new(store)),
            sessions: Mutex::new(HashMap::new()),
            resync_tx,
        }
    }

    /// The stream for `session_id`, created on first use.
    ///
    /// A terminated stream is replaced by a fresh one that resumes numbering
    /// after its watermark.
    pub fn session(&self, session_id: &SessionId) -> Result<Arc<SessionStream>> {
        let mut sessions = self.sessions.lock();
        match sessions.get(session_id) {
            Some(stream) if !stream.is_terminated() => return Ok(Arc::clone(stream)),
            Some(_) => {
                let _ = sessions.remove(session_id);
                self.generator.release(session_id);
                debug!(session_id = %session_id, "replacing terminated session stream");
            }
            None => {}
        }
        let stream = Arc::new(SessionStream::new(
            session_id.clone(),
            Arc::clone(&self.generator),
            self.config.retention,
            self.config.subscriber_capacity,
            self.resync_tx.clone(),
        )?);
        let _ = sessions.insert(session_id.clone(), Arc::clone(&stream));
        gauge!("stream_sessions_active").set(sessions.len() as f64);
        info!(session_id = %session_id, "session stream created");
        Ok(stream)
    }

    /// The stream for `session_id`, if it exists.
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<SessionStream>> {
        self.sessions.lock().get(session_id).cloned()
    }

    /// Emit one event into `session_id`. The only way data enters a stream.
    pub fn emit(
        &self,
        session_id: &SessionId,
        event_type: EventType,
        data: Value,
    ) -> Result<Arc<EventEnvelope>> {
        let stream = self.session(session_id)?;
        let result = stream.emit(event_type, data);
        if let Err(StreamError::SequenceExhausted { .. }) = &result {
            let _ = self.retire(session_id, &stream);
        }
        result
    }

    /// Remove `stream` from the map if it is still the one registered.
    fn retire(&self, session_id: &SessionId, stream: &Arc<SessionStream>) -> bool {
        let mut sessions = self.sessions.lock();
        let current = sessions
            .get(session_id)
            .is_some_and(|s| Arc::ptr_eq(s, stream));
        if current {
            let _ = sessions.remove(session_id);
            self.generator.release(session_id);
            gauge!("stream_sessions_active").set(sessions.len() as f64);
        }
        current
    }

    /// Drop every dormant stream and return the sessions removed.
    ///
    /// A live stream is only dropped when nothing outside the hub holds it,
    /// so a detached connection never ends up on a stream producers no
    /// longer reach. Every clone leaves the map under this lock, which makes
    /// the reference count exact here.
    pub fn sweep_dormant(&self) -> Vec<SessionId> {
        let mut sessions = self.sessions.lock();
        let mut removed = Vec::new();
        sessions.retain(|session_id, stream| {
            let unreferenced = Arc::strong_count(stream) == 1 || stream.is_terminated();
            if unreferenced && stream.is_dormant() {
                removed.push(session_id.clone());
                false
            } else {
                true
            }
        });
        for session_id in &removed {
            self.generator.release(session_id);
        }
        gauge!("stream_sessions_active").set(sessions.len() as f64);
        if !removed.is_empty() {
            debug!(count = removed.len(), "dormant session streams dropped");
        }
        removed
    }

    /// Tear down a session: attached connections get a terminal envelope,
    /// the stream is dropped, and its counter released. The watermark is
    /// kept so a re-created session continues numbering.
    pub fn dispose(&self, session_id: &SessionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(session_id);
            gauge!("stream_sessions_active").set(sessions.len() as f64);
            removed
        };
        let Some(stream) = removed else {
            return false;
        };
        stream.terminate("SESSION_CLOSED", "session disposed");
        self.generator.release(session_id);
        info!(session_id = %session_id, "session stream disposed");
        true
    }

    /// Subscribe to resync requests. The producer re-issues a snapshot for
    /// each one it receives.
    pub fn resync_requests(&self) -> broadcast::Receiver<ResyncRequest> {
        self.resync_tx.subscribe()
    }

    /// Number of live session streams.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Stream parameters.
    pub fn config(&self) -> StreamConfig {
        self.config
    }
}
