//! Connections whose socket dropped, waiting for a reconnect.
//!
//! A parked connection is already DEGRADED and detached from fan-out; only
//! its cursor survives. A reconnect presenting `resume=<connectionId>` with
//! the same identity and session adopts it. Otherwise its grace timer fires
//! and closes it. A connection that was already DEGRADED when its socket
//! dropped keeps its original deadline. Removal from the map is the single point of ownership
//! transfer, so a timer and a resume can never both claim one connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use docket_core::{ConnectionId, SessionId};
use metrics::{counter, gauge};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::connection::Connection;
use super::state::TransitionCause;
use crate::admission::Identity;
use crate::metrics::{CONNECTIONS_PARKED, CONNECTIONS_RESUMED_TOTAL, WS_DISCONNECTIONS_TOTAL};

struct Parked {
    connection: Arc<Connection>,
    generation: u64,
    grace: CancellationToken,
}

/// Registry of parked connections.
pub struct ParkedConnections {
    grace_period: Duration,
    entries: DashMap<ConnectionId, Parked>,
    generations: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl ParkedConnections {
    /// Registry whose timers run on `tracker` and stop with `shutdown`.
    pub fn new(
        grace_period: Duration,
        tracker: TaskTracker,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            grace_period,
            entries: DashMap::new(),
            generations: AtomicU64::new(0),
            tracker,
            shutdown,
        })
    }

    /// Park `connection` and start its grace timer, or continue the one it
    /// already runs.
    pub fn park(self: &Arc<Self>, connection: Arc<Connection>) {
        let id = connection.id().clone();
        let deadline = connection.start_grace(self.grace_period);
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let grace = self.shutdown.child_token();
        if let Some(previous) = self.entries.insert(
            id.clone(),
            Parked {
                connection: Arc::clone(&connection),
                generation,
                grace: grace.clone(),
            },
        ) {
            previous.grace.cancel();
        }
        gauge!(CONNECTIONS_PARKED).set(self.entries.len() as f64);
        info!(
            connection_id = %id,
            session_id = %connection.session_id(),
            last_acked = connection.last_acked(),
            grace_ms = deadline.saturating_duration_since(Instant::now()).as_millis() as u64,
            "connection parked"
        );

        let registry = Arc::clone(self);
        let _ = self.tracker.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {
                    registry.expire(&id, generation, TransitionCause::GraceExpired);
                }
                () = grace.cancelled() => {
                    // either adopted (entry already gone) or shutting down
                    registry.expire(&id, generation, TransitionCause::ServerShutdown);
                }
            }
        });
    }

    fn expire(&self, id: &ConnectionId, generation: u64, cause: TransitionCause) {
        let Some((_, parked)) = self
            .entries
            .remove_if(id, |_, p| p.generation == generation)
        else {
            return;
        };
        gauge!(CONNECTIONS_PARKED).set(self.entries.len() as f64);
        if parked.connection.close(cause) {
            counter!(WS_DISCONNECTIONS_TOTAL, "cause" => cause.as_str()).increment(1);
        }
    }

    /// Adopt a parked connection. Only the identity and session it was
    /// admitted with may resume it.
    pub fn take(
        &self,
        id: &ConnectionId,
        identity: &Identity,
        session_id: &SessionId,
    ) -> Option<Arc<Connection>> {
        let (_, parked) = self.entries.remove_if(id, |_, p| {
            p.connection.identity().subject == identity.subject
                && p.connection.session_id() == session_id
        })?;
        parked.grace.cancel();
        gauge!(CONNECTIONS_PARKED).set(self.entries.len() as f64);
        counter!(CONNECTIONS_RESUMED_TOTAL).increment(1);
        debug!(connection_id = %id, "parked connection adopted");
        Some(parked.connection)
    }

    /// Sessions with at least one parked connection.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.entries
            .iter()
            .map(|e| e.connection.session_id().clone())
            .collect()
    }

    /// Whether `id` is parked.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Number of parked connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AuthMethod;
    use crate::mode::StreamMode;
    use crate::websocket::state::ConnectionState;

    fn identity(subject: &str) -> Identity {
        Identity {
            subject: subject.into(),
            method: AuthMethod::StaticToken,
        }
    }

    fn degraded(id: &str, subject: &str) -> Arc<Connection> {
        let c = Arc::new(Connection::new(
            ConnectionId::parse(id).unwrap(),
            SessionId::parse("job-1").unwrap(),
            identity(subject),
            1,
            StreamMode::Live,
            0,
        ));
        let _ = c
            .transition(ConnectionState::Active, TransitionCause::Attached)
            .unwrap();
        let _ = c
            .transition(ConnectionState::Degraded, TransitionCause::SocketDropped)
            .unwrap();
        c
    }

    fn registry(grace: Duration) -> (Arc<ParkedConnections>, CancellationToken) {
        let shutdown = CancellationToken::new();
        (
            ParkedConnections::new(grace, TaskTracker::new(), shutdown.clone()),
            shutdown,
        )
    }

    fn cid(s: &str) -> ConnectionId {
        ConnectionId::parse(s).unwrap()
    }

    fn sid() -> SessionId {
        SessionId::parse("job-1").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn resume_within_grace_adopts_cursor() {
        let (parked, _shutdown) = registry(Duration::from_secs(30));
        let conn = degraded("c-1", "alice");
        conn.record_sent(40);
        conn.acknowledge(37).unwrap();
        parked.park(Arc::clone(&conn));
        assert!(parked.contains(&cid("c-1")));

        tokio::time::advance(Duration::from_secs(10)).await;
        let adopted = parked.take(&cid("c-1"), &identity("alice"), &sid()).unwrap();
        assert!(Arc::ptr_eq(&adopted, &conn));
        assert_eq!(adopted.last_acked(), 37);
        assert!(parked.is_empty());

        // the cancelled timer must not close the adopted connection
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(adopted.state(), ConnectionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_closes() {
        let (parked, _shutdown) = registry(Duration::from_secs(5));
        let conn = degraded("c-2", "alice");
        parked.park(Arc::clone(&conn));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(parked.is_empty());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(parked.take(&cid("c-2"), &identity("alice"), &sid()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_connection_keeps_its_original_deadline() {
        let (parked, _shutdown) = registry(Duration::from_secs(30));
        let conn = degraded("c-6", "alice");
        let _ = conn.start_grace(Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(4)).await;

        parked.park(Arc::clone(&conn));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(parked.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn session_ids_lists_parked_sessions() {
        let (parked, _shutdown) = registry(Duration::from_secs(30));
        parked.park(degraded("c-7", "alice"));
        assert_eq!(parked.session_ids(), vec![sid()]);
    }

    #[tokio::test(start_paused = true)]
    async fn other_identity_cannot_resume() {
        let (parked, _shutdown) = registry(Duration::from_secs(30));
        parked.park(degraded("c-3", "alice"));
        assert!(parked.take(&cid("c-3"), &identity("mallory"), &sid()).is_none());
        assert!(
            parked
                .take(&cid("c-3"), &identity("alice"), &SessionId::parse("job-2").unwrap())
                .is_none()
        );
        assert!(parked.contains(&cid("c-3")));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_parked() {
        let (parked, shutdown) = registry(Duration::from_secs(300));
        let conn = degraded("c-4", "alice");
        parked.park(Arc::clone(&conn));
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(parked.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_is_logged() {
        let (logs, _guard) = docket_core::logging::capture_logs();
        let (parked, _shutdown) = registry(Duration::from_secs(1));
        parked.park(degraded("c-5", "alice"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let closed: Vec<_> = logs
            .matching("connection state transition")
            .into_iter()
            .filter(|e| e.field("to") == Some("closed"))
            .collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].field("cause"), Some("grace_expired"));
    }
}
