//! Per-session broadcaster.
//!
//! A [`SessionStream`] exclusively owns one session's [`EventBuffer`] and
//! its fan-out set. Emission (sequence assignment, buffering, fan-out) and
//! attachment (replay resolution, subscriber registration) run under the
//! same lock, so a connection switching from replay to live can neither
//! miss nor duplicate an envelope.
//!
//! Live delivery uses a bounded queue per subscriber with `try_send`. A
//! subscriber whose queue is full is detached on the spot: the producer is
//! never blocked by a slow consumer. The detached consumer sees its queue
//! close and re-attaches from its own cursor.
//!
//! A terminated stream keeps its terminal envelope. Consumers that were not
//! attached when the session ended, or whose queue had no room for it, read
//! it from [`SessionStream::terminal_envelope`] when their re-attach fails.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use docket_core::{ConnectionId, SessionId};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::buffer::{EventBuffer, RetentionPolicy};
use crate::envelope::{EventEnvelope, EventPayload, EventType, ResyncPayload};
use crate::errors::{Result, StreamError};
use crate::replay::{ReplayController, ReplayPlan};
use crate::sequence::SequenceGenerator;

/// Published when a connection needs a full snapshot from the producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResyncRequest {
    /// Session to re-snapshot.
    pub session_id: SessionId,
    /// Connection that triggered the resync.
    pub connection_id: ConnectionId,
    /// Sequence of the `resync_required` envelope itself.
    pub resync_sequence: u64,
    /// The stale cursor.
    pub last_acked: u64,
}

/// What a connection gets back from [`SessionStream::attach`].
#[derive(Debug)]
pub struct Attachment {
    /// Envelopes to send before anything from `live`, in order. For a
    /// resync this is the single `resync_required` envelope.
    pub backlog: Vec<Arc<EventEnvelope>>,
    /// Live envelopes emitted after the backlog.
    pub live: mpsc::Receiver<Arc<EventEnvelope>>,
    /// Whether the cursor fell outside the retention window.
    pub resynced: bool,
}

struct Inner {
    buffer: EventBuffer,
    subscribers: HashMap<ConnectionId, mpsc::Sender<Arc<EventEnvelope>>>,
    terminal: Option<Arc<EventEnvelope>>,
}

/// One session's buffer, sequence, and fan-out set.
pub struct SessionStream {
    session_id: SessionId,
    generator: Arc<SequenceGenerator>,
    subscriber_capacity: usize,
    resync_tx: broadcast::Sender<ResyncRequest>,
    inner: Mutex<Inner>,
}

impl SessionStream {
    /// Build a stream whose buffer resumes after the generator's current mark.
    pub fn new(
        session_id: SessionId,
        generator: Arc<SequenceGenerator>,
        retention: RetentionPolicy,
        subscriber_capacity: usize,
        resync_tx: broadcast::Sender<ResyncRequest>,
    ) -> Result<Self> {
        let last_issued = generator.current(&session_id)?;
        Ok(Self {
            session_id,
            generator,
            subscriber_capacity: subscriber_capacity.max(1),
            resync_tx,
            inner: Mutex::new(Inner {
                buffer: EventBuffer::starting_after(retention, last_issued),
                subscribers: HashMap::new(),
                terminal: None,
            }),
        })
    }

    /// The session this stream carries.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Validate `data` against `event_type`, then sequence, buffer, and fan
    /// out the resulting envelope.
    ///
    /// An invalid payload fails with [`StreamError::Encoding`] before a
    /// number is drawn, so the session carries on unaffected.
    pub fn emit(&self, event_type: EventType, data: Value) -> Result<Arc<EventEnvelope>> {
        let payload = EventPayload::from_value(event_type, data).inspect_err(|e| {
            warn!(session_id = %self.session_id, event_type = %event_type, error = %e, "rejected malformed payload");
        })?;
        self.emit_payload(payload)
    }

    /// Emit an already-typed payload.
    pub fn emit_payload(&self, payload: EventPayload) -> Result<Arc<EventEnvelope>> {
        payload.validate()?;
        let mut inner = self.inner.lock();
        self.emit_locked(&mut inner, payload)
    }

    fn emit_locked(&self, inner: &mut Inner, payload: EventPayload) -> Result<Arc<EventEnvelope>> {
        if inner.terminal.is_some() {
            return Err(StreamError::SessionTerminated(self.session_id.clone()));
        }
        let sequence = match self.generator.next(&self.session_id) {
            Ok(seq) => seq,
            Err(err @ StreamError::SequenceExhausted { .. }) => {
                self.terminate_locked(inner, err.code(), &err.to_string());
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let event_type = payload.event_type();
        let envelope = Arc::new(EventEnvelope::seal(
            sequence,
            self.session_id.clone(),
            payload,
            Utc::now(),
        ));
        let evicted = inner.buffer.append(Arc::clone(&envelope))?;
        if evicted > 0 {
            counter!("stream_envelopes_evicted_total").increment(evicted as u64);
        }
        self.fan_out_locked(inner, &envelope);

        counter!("stream_events_emitted_total", "type" => event_type.as_str()).increment(1);
        debug!(
            session_id = %self.session_id,
            sequence,
            event_type = %event_type,
            subscribers = inner.subscribers.len(),
            "event emitted"
        );
        Ok(envelope)
    }

    fn fan_out_locked(&self, inner: &mut Inner, envelope: &Arc<EventEnvelope>) {
        inner.subscribers.retain(|connection_id, tx| {
            match tx.try_send(Arc::clone(envelope)) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        sequence = envelope.sequence_number(),
                        "subscriber lagging, detaching from live fan-out"
                    );
                    counter!("stream_subscribers_lagged_total").increment(1);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    /// Attach `connection_id` with cursor `last_acked`.
    ///
    /// Resolves the cursor and registers the live subscriber in one step.
    /// Re-attaching an id already present replaces its old queue.
    ///
    /// # Errors
    ///
    /// [`StreamError::SequenceGap`] for a cursor beyond the latest issued
    /// number, [`StreamError::SessionTerminated`] once the session ended.
    pub fn attach(&self, connection_id: &ConnectionId, last_acked: u64) -> Result<Attachment> {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return Err(StreamError::SessionTerminated(self.session_id.clone()));
        }
        let _ = inner.buffer.evict_expired(Utc::now());

        let (backlog, resynced) =
            match ReplayController::resolve(&self.session_id, &inner.buffer, last_acked)? {
                ReplayPlan::Replay(backlog) => {
                    counter!("stream_envelopes_replayed_total").increment(backlog.len() as u64);
                    histogram!("stream_replay_batch_size").record(backlog.len() as f64);
                    (backlog, false)
                }
                ReplayPlan::Resync {
                    last_acked,
                    oldest_retained,
                    latest_sequence,
                } => {
                    let payload = EventPayload::ResyncRequired(ResyncPayload {
                        last_acked,
                        oldest_retained,
                        latest_sequence,
                        connection_id: Some(connection_id.clone()),
                    });
                    let envelope = self.emit_locked(&mut inner, payload)?;
                    info!(
                        session_id = %self.session_id,
                        connection_id = %connection_id,
                        last_acked,
                        oldest_retained,
                        "cursor outside retention window, resync required"
                    );
                    counter!("stream_resyncs_total").increment(1);
                    let _ = self.resync_tx.send(ResyncRequest {
                        session_id: self.session_id.clone(),
                        connection_id: connection_id.clone(),
                        resync_sequence: envelope.sequence_number(),
                        last_acked,
                    });
                    (vec![envelope], true)
                }
            };

        let (tx, live) = mpsc::channel(self.subscriber_capacity);
        let _ = inner.subscribers.insert(connection_id.clone(), tx);
        debug!(
            session_id = %self.session_id,
            connection_id = %connection_id,
            last_acked,
            backlog = backlog.len(),
            resynced,
            "subscriber attached"
        );
        Ok(Attachment {
            backlog,
            live,
            resynced,
        })
    }

    /// Remove `connection_id` from the fan-out set. Returns whether it was
    /// attached. After this returns no further envelope is queued for it.
    pub fn detach(&self, connection_id: &ConnectionId) -> bool {
        let removed = self
            .inner
            .lock()
            .subscribers
            .remove(connection_id)
            .is_some();
        if removed {
            debug!(session_id = %self.session_id, connection_id = %connection_id, "subscriber detached");
        }
        removed
    }

    /// End the session. Every attached subscriber is offered a terminal
    /// error envelope and dropped. A subscriber whose queue is full misses
    /// the push and finds the envelope through [`Self::terminal_envelope`]
    /// instead. Idempotent.
    pub fn terminate(&self, code: &str, message: &str) {
        let mut inner = self.inner.lock();
        self.terminate_locked(&mut inner, code, message);
    }

    fn terminate_locked(&self, inner: &mut Inner, code: &str, message: &str) {
        if inner.terminal.is_some() {
            return;
        }
        let terminal = Arc::new(EventEnvelope::terminal_error(
            self.session_id.clone(),
            code,
            message,
        ));
        let mut missed = 0usize;
        for (connection_id, tx) in inner.subscribers.drain() {
            if tx.try_send(Arc::clone(&terminal)).is_err() {
                debug!(session_id = %self.session_id, connection_id = %connection_id, "terminal envelope not queued");
                missed += 1;
            }
        }
        inner.terminal = Some(terminal);
        warn!(session_id = %self.session_id, code, message, missed, "session terminated");
    }

    /// Whether the session has ended.
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }

    /// The fatal envelope the session ended with, once terminated.
    pub fn terminal_envelope(&self) -> Option<Arc<EventEnvelope>> {
        self.inner.lock().terminal.clone()
    }

    /// Whether dropping this stream loses nothing: it has terminated, or it
    /// has no subscribers and its whole window has aged out. A dormant live
    /// stream is indistinguishable from one rebuilt from the watermark.
    pub fn is_dormant(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return true;
        }
        if !inner.subscribers.is_empty() {
            return false;
        }
        let _ = inner.buffer.evict_expired(Utc::now());
        inner.buffer.is_empty()
    }

    /// Highest sequence issued so far.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.lock().buffer.latest_sequence()
    }

    /// Oldest sequence still replayable.
    pub fn oldest_retained_sequence(&self) -> u64 {
        self.inner.lock().buffer.oldest_retained_sequence()
    }

    /// Retained envelopes in `from..=to`.
    pub fn range(&self, from: u64, to: u64) -> Vec<Arc<EventEnvelope>> {
        self.inner.lock().buffer.range(from, to)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}
