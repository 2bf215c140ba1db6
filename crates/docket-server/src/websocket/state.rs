//! Connection lifecycle state machine.
//!
//! ```text
//! INITIALIZING ──► ACTIVE ◄──► DEGRADED
//!       │            │            │
//!       └────────────┴────────────┴──► CLOSED
//! ```
//!
//! Only [`StateMachine::transition`] changes state. Re-entering the current
//! state is a silent no-op (no log line, no metric), which keeps repeated
//! keepalive misses while DEGRADED from producing duplicate transitions.
//! Leaving CLOSED, or returning to INITIALIZING, is rejected.

use docket_core::{ConnectionId, SessionId};
use metrics::counter;
use thiserror::Error;
use tracing::info;

use crate::metrics::CONNECTION_TRANSITIONS_TOTAL;

/// Lifecycle state of one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Admitted; handshake and attach in progress, nothing served yet.
    Initializing,
    /// Pushing live envelopes.
    Active,
    /// Believed unresponsive; detached from fan-out, cursor retained.
    Degraded,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Lowercase name for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        }
    }

    fn may_become(self, to: Self) -> bool {
        use ConnectionState::{Active, Closed, Degraded, Initializing};
        matches!(
            (self, to),
            (Initializing, Active | Closed)
                | (Active, Degraded | Closed)
                | (Degraded, Active | Closed)
        )
    }
}

/// What triggered a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransitionCause {
    /// Handshake and attach completed.
    Attached,
    /// A parked connection was adopted by a reconnect.
    Resumed,
    /// Heartbeat threshold crossed with no client activity.
    KeepaliveMissed,
    /// Any inbound frame while DEGRADED.
    ClientActivity,
    /// The socket dropped without a close frame.
    SocketDropped,
    /// The client sent a close.
    ClientClosed,
    /// DEGRADED outlasted the grace period.
    GraceExpired,
    /// The client acknowledged a sequence it was never sent.
    ProtocolViolation,
    /// The session ended (disposed or sequence exhausted).
    SessionTerminated,
    /// The handshake did not finish in time.
    HandshakeTimeout,
    /// Server shutdown.
    ServerShutdown,
    /// The session stream failed to serve the connection.
    StreamFailure,
}

impl TransitionCause {
    /// Snake-case name for logs and metric labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Attached => "attached",
            Self::Resumed => "resumed",
            Self::KeepaliveMissed => "keepalive_missed",
            Self::ClientActivity => "client_activity",
            Self::SocketDropped => "socket_dropped",
            Self::ClientClosed => "client_closed",
            Self::GraceExpired => "grace_expired",
            Self::ProtocolViolation => "protocol_violation",
            Self::SessionTerminated => "session_terminated",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::ServerShutdown => "server_shutdown",
            Self::StreamFailure => "stream_failure",
        }
    }
}

/// A transition the lifecycle does not allow.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("illegal connection transition {} -> {}", from.as_str(), to.as_str())]
pub struct IllegalTransition {
    /// State before the attempt.
    pub from: ConnectionState,
    /// Requested state.
    pub to: ConnectionState,
}

/// One connection's state plus the identifiers its log lines carry.
#[derive(Debug)]
pub struct StateMachine {
    connection_id: ConnectionId,
    session_id: SessionId,
    state: ConnectionState,
    last_cause: Option<TransitionCause>,
}

impl StateMachine {
    /// A machine in INITIALIZING.
    pub fn new(connection_id: ConnectionId, session_id: SessionId) -> Self {
        Self {
            connection_id,
            session_id,
            state: ConnectionState::Initializing,
            last_cause: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Cause of the most recent effective transition.
    pub fn last_cause(&self) -> Option<TransitionCause> {
        self.last_cause
    }

    /// Move to `to`.
    ///
    /// Returns `Ok(true)` when the state changed, `Ok(false)` when already in
    /// `to`.
    pub fn transition(
        &mut self,
        to: ConnectionState,
        cause: TransitionCause,
    ) -> Result<bool, IllegalTransition> {
        let from = self.state;
        if from == to {
            return Ok(false);
        }
        if !from.may_become(to) {
            return Err(IllegalTransition { from, to });
        }
        self.state = to;
        self.last_cause = Some(cause);
        counter!(CONNECTION_TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        info!(
            connection_id = %self.connection_id,
            session_id = %self.session_id,
            from = from.as_str(),
            to = to.as_str(),
            cause = cause.as_str(),
            "connection state transition"
        );
        Ok(true)
    }
}
