//! Per-connection state shared between the handler, its keepalive task, and
//! the parked-connection registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use docket_core::{ConnectionId, SessionId};
use docket_events::StreamError;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::state::{ConnectionState, IllegalTransition, StateMachine, TransitionCause};
use crate::admission::Identity;
use crate::mode::StreamMode;

/// A client attachment to one session.
///
/// Holds a read cursor into the session's buffer, never the buffer itself:
/// `last_sent` is the highest sequence pushed on the current socket and
/// `last_acked` the highest the client confirmed.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    session_id: SessionId,
    identity: Identity,
    protocol_version: u32,
    mode: StreamMode,
    last_acked: AtomicU64,
    last_sent: AtomicU64,
    /// Set by any inbound frame, cleared by each keepalive tick.
    is_alive: AtomicBool,
    last_seen: Mutex<Instant>,
    /// When DEGRADED must end, while a grace period runs.
    grace_deadline: Mutex<Option<Instant>>,
    connected_at: Instant,
    machine: Mutex<StateMachine>,
}

impl Connection {
    /// A new connection in INITIALIZING whose cursor starts at `last_acked`.
    pub fn new(
        id: ConnectionId,
        session_id: SessionId,
        identity: Identity,
        protocol_version: u32,
        mode: StreamMode,
        last_acked: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            machine: Mutex::new(StateMachine::new(id.clone(), session_id.clone())),
            id,
            session_id,
            identity,
            protocol_version,
            mode,
            last_acked: AtomicU64::new(last_acked),
            last_sent: AtomicU64::new(last_acked),
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            grace_deadline: Mutex::new(None),
            connected_at: now,
        }
    }

    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Session streamed.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Authenticated principal.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Negotiated protocol version.
    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    /// Envelope source.
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Highest sequence the client acknowledged.
    pub fn last_acked(&self) -> u64 {
        self.last_acked.load(Ordering::Acquire)
    }

    /// Highest sequence pushed on the current socket.
    pub fn last_sent(&self) -> u64 {
        self.last_sent.load(Ordering::Acquire)
    }

    /// Record that `sequence` was written to the socket.
    pub fn record_sent(&self, sequence: u64) {
        let _ = self.last_sent.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Apply a client acknowledgement.
    ///
    /// Acks never move the cursor backwards. Acknowledging a sequence that
    /// was never pushed is a protocol violation.
    pub fn acknowledge(&self, sequence: u64) -> Result<(), StreamError> {
        let sent = self.last_sent();
        if sequence > sent {
            return Err(StreamError::SequenceGap {
                session_id: self.session_id.clone(),
                claimed: sequence,
                latest: sent,
            });
        }
        let _ = self.last_acked.fetch_max(sequence, Ordering::AcqRel);
        Ok(())
    }

    /// Restart both cursors at `sequence` for a new socket.
    pub fn reset_cursor(&self, sequence: u64) {
        self.last_acked.store(sequence, Ordering::Release);
        self.last_sent.store(sequence, Ordering::Release);
    }

    /// Note inbound activity.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Release);
        *self.last_seen.lock() = Instant::now();
    }

    /// Check and reset the alive flag. `true` if the client was heard from
    /// since the previous check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::AcqRel)
    }

    /// When the client was last heard from.
    pub fn last_seen(&self) -> Instant {
        *self.last_seen.lock()
    }

    /// Start a grace period of `period` unless one is already running, and
    /// return the deadline in force. A connection that degraded and then
    /// lost its socket keeps the deadline it degraded with.
    pub fn start_grace(&self, period: Duration) -> Instant {
        *self
            .grace_deadline
            .lock()
            .get_or_insert_with(|| Instant::now() + period)
    }

    /// End the running grace period.
    pub fn clear_grace(&self) {
        *self.grace_deadline.lock() = None;
    }

    /// Deadline of the running grace period.
    pub fn grace_deadline(&self) -> Option<Instant> {
        *self.grace_deadline.lock()
    }

    /// When the connection was first admitted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.machine.lock().state()
    }

    /// Attempt a lifecycle transition.
    pub fn transition(
        &self,
        to: ConnectionState,
        cause: TransitionCause,
    ) -> Result<bool, IllegalTransition> {
        self.machine.lock().transition(to, cause)
    }

    /// Close with `cause`. Closing twice is a no-op.
    pub fn close(&self, cause: TransitionCause) -> bool {
        // CLOSED is reachable from every state
        self.transition(ConnectionState::Closed, cause)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AuthMethod;
    use assert_matches::assert_matches;

    fn connection(last_acked: u64) -> Connection {
        Connection::new(
            ConnectionId::parse("c-1").unwrap(),
            SessionId::parse("job-1").unwrap(),
            Identity {
                subject: "alice".into(),
                method: AuthMethod::StaticToken,
            },
            2,
            StreamMode::Live,
            last_acked,
        )
    }

    #[test]
    fn cursor_starts_at_client_ack() {
        let c = connection(85);
        assert_eq!(c.last_acked(), 85);
        assert_eq!(c.last_sent(), 85);
        assert_eq!(c.state(), ConnectionState::Initializing);
    }

    #[test]
    fn acks_are_monotonic_and_bounded_by_sent() {
        let c = connection(0);
        c.record_sent(10);
        c.acknowledge(7).unwrap();
        c.acknowledge(3).unwrap();
        assert_eq!(c.last_acked(), 7);
        assert_matches!(
            c.acknowledge(11),
            Err(StreamError::SequenceGap { claimed: 11, latest: 10, .. })
        );
    }

    #[test]
    fn record_sent_never_regresses() {
        let c = connection(0);
        c.record_sent(5);
        c.record_sent(4);
        assert_eq!(c.last_sent(), 5);
    }

    #[test]
    fn reset_cursor_rewinds_both() {
        let c = connection(0);
        c.record_sent(20);
        c.acknowledge(15).unwrap();
        c.reset_cursor(12);
        assert_eq!((c.last_acked(), c.last_sent()), (12, 12));
    }

    #[test]
    fn alive_flag_is_consumed_by_check() {
        let c = connection(0);
        assert!(c.check_alive());
        assert!(!c.check_alive());
        c.mark_alive();
        assert!(c.check_alive());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_deadline_is_kept_until_cleared() {
        let c = connection(0);
        let first = c.start_grace(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(c.start_grace(Duration::from_secs(30)), first);
        c.clear_grace();
        assert_eq!(c.grace_deadline(), None);
        let second = c.start_grace(Duration::from_secs(5));
        assert!(second > first);
    }

    #[test]
    fn close_is_idempotent() {
        let c = connection(0);
        assert!(c.close(TransitionCause::ClientClosed));
        assert!(!c.close(TransitionCause::ServerShutdown));
        assert_eq!(c.state(), ConnectionState::Closed);
    }
}
