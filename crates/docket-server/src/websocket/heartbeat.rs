//! Keepalive timing.
//!
//! One task per connection, cancelled with the connection. Each tick asks
//! the handler to send a heartbeat frame and checks whether the client was
//! heard from since the previous tick. After `missed_threshold` silent ticks
//! in a row it reports [`KeepaliveSignal::Degraded`] once; the count only
//! re-arms after the client is heard from again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::Connection;

/// What the keepalive task asks of its handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepaliveSignal {
    /// Send a heartbeat frame.
    Beat,
    /// The client has been silent for the whole threshold.
    Degraded {
        /// Consecutive silent ticks.
        missed: u32,
    },
}

/// Why the keepalive task stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeepaliveExit {
    /// The token was cancelled.
    Cancelled,
    /// The handler stopped listening.
    HandlerGone,
}

/// Run keepalive ticks for `connection` until cancelled.
pub async fn run_keepalive(
    connection: Arc<Connection>,
    interval: Duration,
    missed_threshold: u32,
    signals: mpsc::Sender<KeepaliveSignal>,
    cancel: CancellationToken,
) -> KeepaliveExit {
    let threshold = missed_threshold.max(1);
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return KeepaliveExit::Cancelled,
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed = missed.saturating_add(1);
                }
                if signals.send(KeepaliveSignal::Beat).await.is_err() {
                    return KeepaliveExit::HandlerGone;
                }
                if missed == threshold
                    && signals.send(KeepaliveSignal::Degraded { missed }).await.is_err()
                {
                    return KeepaliveExit::HandlerGone;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AuthMethod, Identity};
    use crate::mode::StreamMode;
    use docket_core::{ConnectionId, SessionId};

    fn connection() -> Arc<Connection> {
        Arc::new(Connection::new(
            ConnectionId::parse("hb").unwrap(),
            SessionId::parse("s").unwrap(),
            Identity {
                subject: "alice".into(),
                method: AuthMethod::StaticToken,
            },
            1,
            StreamMode::Live,
            0,
        ))
    }

    fn spawn(
        conn: Arc<Connection>,
        threshold: u32,
    ) -> (mpsc::Receiver<KeepaliveSignal>, CancellationToken, tokio::task::JoinHandle<KeepaliveExit>) {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_keepalive(
            conn,
            Duration::from_secs(1),
            threshold,
            tx,
            cancel.clone(),
        ));
        (rx, cancel, handle)
    }

    async fn next(rx: &mut mpsc::Receiver<KeepaliveSignal>) -> KeepaliveSignal {
        rx.recv().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn beats_every_interval() {
        let conn = connection();
        let (mut rx, cancel, handle) = spawn(Arc::clone(&conn), 3);
        for _ in 0..3 {
            conn.mark_alive();
            assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        }
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), KeepaliveExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn degrades_once_after_threshold() {
        let conn = connection();
        let _ = conn.check_alive();
        let (mut rx, cancel, _handle) = spawn(conn, 2);

        assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        assert_eq!(next(&mut rx).await, KeepaliveSignal::Degraded { missed: 2 });
        // further silence does not repeat the signal
        for _ in 0..4 {
            assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn activity_rearms_the_count() {
        let conn = connection();
        let _ = conn.check_alive();
        let (mut rx, cancel, _handle) = spawn(Arc::clone(&conn), 2);

        assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        assert_eq!(next(&mut rx).await, KeepaliveSignal::Degraded { missed: 2 });

        conn.mark_alive();
        assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        assert_eq!(next(&mut rx).await, KeepaliveSignal::Beat);
        assert_eq!(next(&mut rx).await, KeepaliveSignal::Degraded { missed: 2 });
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_handler_drops_receiver() {
        let conn = connection();
        let (rx, _cancel, handle) = spawn(conn, 3);
        drop(rx);
        assert_eq!(handle.await.unwrap(), KeepaliveExit::HandlerGone);
    }
}
