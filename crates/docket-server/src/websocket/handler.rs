//! Per-connection push loop.
//!
//! One [`ConnectionHandler`] task per socket. After the `connected` frame it
//! attaches to the session (replay or resync, then live) and goes ACTIVE.
//! From then on it waits on four things only: inbound frames, the live
//! queue, keepalive signals, and the DEGRADED grace deadline.
//!
//! DEGRADED detaches from fan-out but keeps the cursor. Any inbound frame
//! restores ACTIVE by re-attaching from the last pushed sequence, so a
//! client that recovers inside the retention window never needs a resync.
//! A socket that drops without a close frame parks the connection for a
//! later `resume`.
//!
//! Every fatal close is preceded by exactly one terminal `error` envelope.
//! When the session ended while this connection was detached or lagging,
//! the envelope comes from the stream's record of how it ended.

use std::future;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use chrono::Utc;
use docket_core::SessionId;
use docket_events::{EventEnvelope, EventPayload, MockScript, SessionStream, StreamError};
use futures::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::connection::Connection;
use super::frames::{ClientFrame, ServerFrame};
use super::heartbeat::{KeepaliveSignal, run_keepalive};
use super::parked::ParkedConnections;
use super::state::{ConnectionState, TransitionCause};
use crate::config::KeepaliveConfig;
use crate::metrics::{
    HEARTBEATS_SENT_TOTAL, REATTACHMENTS_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

type LiveQueue = mpsc::Receiver<Arc<EventEnvelope>>;

/// Where a connection's envelopes come from.
#[derive(Clone)]
pub enum StreamSource {
    /// The live session broadcaster.
    Live(Arc<SessionStream>),
    /// The canned script.
    Mock(Arc<MockScript>),
}

struct Attached {
    backlog: Vec<Arc<EventEnvelope>>,
    live: Option<LiveQueue>,
    resynced: bool,
}

impl StreamSource {
    fn latest_sequence(&self) -> u64 {
        match self {
            Self::Live(stream) => stream.latest_sequence(),
            Self::Mock(script) => script.latest_sequence(),
        }
    }

    fn attach(&self, connection: &Connection, cursor: u64) -> Result<Attached, StreamError> {
        match self {
            Self::Live(stream) => {
                let attachment = stream.attach(connection.id(), cursor)?;
                Ok(Attached {
                    backlog: attachment.backlog,
                    live: Some(attachment.live),
                    resynced: attachment.resynced,
                })
            }
            Self::Mock(script) => Ok(Attached {
                backlog: script.envelopes_after(cursor)?,
                live: None,
                resynced: false,
            }),
        }
    }

    fn detach(&self, connection: &Connection) {
        if let Self::Live(stream) = self {
            let _ = stream.detach(connection.id());
        }
    }

    fn terminal_envelope(&self) -> Option<Arc<EventEnvelope>> {
        match self {
            Self::Live(stream) => stream.terminal_envelope(),
            Self::Mock(_) => None,
        }
    }
}

/// How the push loop ended.
#[derive(Debug)]
enum Exit {
    /// Server-initiated close with a `closing` frame.
    Close {
        cause: TransitionCause,
        code: &'static str,
        reason: String,
        /// Fatal envelope still owed to the client.
        terminal: Option<Arc<EventEnvelope>>,
    },
    /// The client asked to close.
    ClientClosed,
    /// The socket failed or ended without a close frame.
    Dropped,
}

impl Exit {
    /// Close without a terminal envelope.
    fn close(cause: TransitionCause, code: &'static str, reason: impl Into<String>) -> Self {
        Self::Close {
            cause,
            code,
            reason: reason.into(),
            terminal: None,
        }
    }

    /// Close after pushing a terminal `error` envelope carrying `code`.
    fn fatal(
        session_id: &SessionId,
        cause: TransitionCause,
        code: &'static str,
        reason: String,
    ) -> Self {
        let terminal = EventEnvelope::terminal_error(session_id.clone(), code, reason.as_str());
        Self::Close {
            cause,
            code,
            reason,
            terminal: Some(Arc::new(terminal)),
        }
    }

    /// Close after pushing the envelope a stream ended with.
    fn ended(terminal: Arc<EventEnvelope>) -> Self {
        let (code, reason) = terminal_reason(&terminal);
        Self::Close {
            cause: TransitionCause::SessionTerminated,
            code,
            reason,
            terminal: Some(terminal),
        }
    }
}

/// Drives one socket for one [`Connection`].
pub struct ConnectionHandler {
    connection: Arc<Connection>,
    source: StreamSource,
    resumed: bool,
    keepalive: KeepaliveConfig,
    parked: Arc<ParkedConnections>,
    shutdown: CancellationToken,
}

impl ConnectionHandler {
    /// Handler for an admitted (or adopted) connection.
    pub fn new(
        connection: Arc<Connection>,
        source: StreamSource,
        resumed: bool,
        keepalive: KeepaliveConfig,
        parked: Arc<ParkedConnections>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection,
            source,
            resumed,
            keepalive,
            parked,
            shutdown,
        }
    }

    /// The connection this handler drives.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Map a stream error to the close it causes.
    fn stream_exit(&self, err: &StreamError) -> Exit {
        let session_id = self.connection.session_id();
        match err {
            StreamError::SessionTerminated(_) | StreamError::SequenceExhausted { .. } => {
                match self.source.terminal_envelope() {
                    Some(terminal) => Exit::ended(terminal),
                    None => Exit::fatal(
                        session_id,
                        TransitionCause::SessionTerminated,
                        err.code(),
                        err.to_string(),
                    ),
                }
            }
            StreamError::SequenceGap { .. } => Exit::fatal(
                session_id,
                TransitionCause::ProtocolViolation,
                err.code(),
                err.to_string(),
            ),
            _ => Exit::fatal(
                session_id,
                TransitionCause::StreamFailure,
                err.code(),
                err.to_string(),
            ),
        }
    }

    /// Serve an upgraded socket until it closes.
    pub async fn run(self, socket: WebSocket) {
        let (sink, inbound) = socket.split();
        self.serve(sink, inbound).await;
    }

    /// Serve any message sink/stream pair. [`run`](Self::run) is this over a
    /// real WebSocket.
    pub async fn serve<S, R>(self, mut sink: S, mut inbound: R)
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let span = info_span!(
            "connection",
            connection_id = %self.connection.id(),
            session_id = %self.connection.session_id(),
            mode = self.connection.mode().as_str(),
        );
        async move {
            counter!(WS_CONNECTIONS_TOTAL, "mode" => self.connection.mode().as_str()).increment(1);
            gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

            let exit = match self.drive(&mut sink, &mut inbound).await {
                Ok(()) => Exit::ClientClosed,
                Err(exit) => exit,
            };
            self.source.detach(&self.connection);
            self.finish(&mut sink, exit).await;

            gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
        }
        .instrument(span)
        .await;
    }

    async fn drive<S, R>(&self, sink: &mut S, inbound: &mut R) -> Result<(), Exit>
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
        R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    {
        let cursor = self.connection.last_sent();
        let handshake = async {
            send_frame(
                sink,
                &ServerFrame::Connected {
                    connection_id: self.connection.id(),
                    session_id: self.connection.session_id(),
                    protocol_version: self.connection.protocol_version(),
                    mode: self.connection.mode(),
                    latest_sequence: self.source.latest_sequence(),
                    resumed: self.resumed,
                },
            )
            .await?;
            self.source
                .attach(&self.connection, cursor)
                .map_err(|e| self.stream_exit(&e))
        };
        let attached = timeout(self.keepalive.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                Exit::close(
                    TransitionCause::HandshakeTimeout,
                    "HANDSHAKE_TIMEOUT",
                    format!("handshake exceeded {:?}", self.keepalive.handshake_timeout),
                )
            })??;

        let cause = if self.resumed {
            TransitionCause::Resumed
        } else {
            TransitionCause::Attached
        };
        let _ = self
            .connection
            .transition(ConnectionState::Active, cause)
            .map_err(|e| {
                Exit::fatal(
                    self.connection.session_id(),
                    TransitionCause::StreamFailure,
                    "ILLEGAL_STATE",
                    e.to_string(),
                )
            })?;
        self.connection.clear_grace();
        info!(
            cursor,
            backlog = attached.backlog.len(),
            resynced = attached.resynced,
            "connection attached"
        );
        let mut live = self.push_backlog(sink, attached).await?;

        let keepalive_cancel = self.shutdown.child_token();
        let _keepalive_guard = keepalive_cancel.clone().drop_guard();
        let (signal_tx, mut signals) = mpsc::channel(8);
        let _ = tokio::spawn(
            run_keepalive(
                Arc::clone(&self.connection),
                self.keepalive.interval,
                self.keepalive.missed_threshold,
                signal_tx,
                keepalive_cancel,
            )
            .in_current_span(),
        );

        let mut grace_deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => {
                    return Err(Exit::close(
                        TransitionCause::ServerShutdown,
                        "SERVER_SHUTDOWN",
                        "server shutting down",
                    ));
                }

                message = inbound.next() => {
                    let message = match message {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            debug!(error = %e, "socket read failed");
                            return Err(Exit::Dropped);
                        }
                        None => return Err(Exit::Dropped),
                    };
                    if matches!(message, Message::Close(_)) {
                        return Ok(());
                    }
                    self.connection.mark_alive();
                    if self.connection.state() == ConnectionState::Degraded {
                        let _ = self
                            .connection
                            .transition(ConnectionState::Active, TransitionCause::ClientActivity);
                        self.connection.clear_grace();
                        grace_deadline = None;
                        live = self.reattach(sink).await?;
                    }
                    if let Message::Text(text) = message {
                        match ClientFrame::parse(text.as_str()) {
                            Ok(ClientFrame::Ack { sequence }) => self
                                .connection
                                .acknowledge(sequence)
                                .map_err(|e| self.stream_exit(&e))?,
                            Ok(ClientFrame::Heartbeat) => {}
                            Ok(ClientFrame::Close) => return Ok(()),
                            Err(e) => warn!(error = %e, "ignoring malformed client frame"),
                        }
                    }
                }

                envelope = next_live(&mut live) => match envelope {
                    Some(envelope) if envelope.is_terminal() => {
                        return Err(Exit::ended(envelope));
                    }
                    Some(envelope) => {
                        send_frame(sink, &ServerFrame::Event { envelope: &envelope }).await?;
                        self.connection.record_sent(envelope.sequence_number());
                    }
                    None => {
                        // detached by the stream for lagging
                        counter!(REATTACHMENTS_TOTAL).increment(1);
                        live = self.reattach(sink).await?;
                    }
                },

                Some(signal) = signals.recv() => match signal {
                    KeepaliveSignal::Beat => {
                        send_frame(
                            sink,
                            &ServerFrame::Heartbeat {
                                server_time: Utc::now(),
                                latest_sequence: self.source.latest_sequence(),
                            },
                        )
                        .await?;
                        counter!(HEARTBEATS_SENT_TOTAL).increment(1);
                    }
                    KeepaliveSignal::Degraded { missed } => {
                        if self
                            .connection
                            .transition(ConnectionState::Degraded, TransitionCause::KeepaliveMissed)
                            .unwrap_or(false)
                        {
                            self.source.detach(&self.connection);
                            live = None;
                            grace_deadline =
                                Some(self.connection.start_grace(self.keepalive.grace_period));
                            debug!(missed, last_sent = self.connection.last_sent(), "detached while degraded");
                        }
                    }
                },

                () = grace_elapsed(grace_deadline) => {
                    return Err(Exit::close(
                        TransitionCause::GraceExpired,
                        "KEEPALIVE_TIMEOUT",
                        "no client activity within the grace period",
                    ));
                }
            }
        }
    }

    /// Re-attach from the last pushed sequence and flush any backlog.
    async fn reattach<S>(&self, sink: &mut S) -> Result<Option<LiveQueue>, Exit>
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
    {
        let cursor = self.connection.last_sent();
        let attached = self
            .source
            .attach(&self.connection, cursor)
            .map_err(|e| self.stream_exit(&e))?;
        debug!(cursor, backlog = attached.backlog.len(), resynced = attached.resynced, "re-attached");
        self.push_backlog(sink, attached).await
    }

    async fn push_backlog<S>(&self, sink: &mut S, attached: Attached) -> Result<Option<LiveQueue>, Exit>
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
    {
        for envelope in &attached.backlog {
            send_frame(sink, &ServerFrame::Event { envelope }).await?;
            self.connection.record_sent(envelope.sequence_number());
        }
        Ok(attached.live)
    }

    async fn finish<S>(&self, sink: &mut S, exit: Exit)
    where
        S: Sink<Message, Error = axum::Error> + Unpin,
    {
        let cause = match exit {
            Exit::Dropped
                if !self.shutdown.is_cancelled()
                    && matches!(
                        self.connection.state(),
                        ConnectionState::Active | ConnectionState::Degraded
                    ) =>
            {
                let _ = self
                    .connection
                    .transition(ConnectionState::Degraded, TransitionCause::SocketDropped);
                self.parked.park(Arc::clone(&self.connection));
                return;
            }
            Exit::Dropped => TransitionCause::SocketDropped,
            Exit::ClientClosed => {
                let _ = sink.send(Message::Close(None)).await;
                TransitionCause::ClientClosed
            }
            Exit::Close {
                cause,
                code,
                reason,
                terminal,
            } => {
                if let Some(terminal) = terminal {
                    let _ = send_frame(sink, &ServerFrame::Event { envelope: &terminal }).await;
                }
                let _ = send_frame(sink, &ServerFrame::Closing { code, reason: &reason }).await;
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code_for(cause),
                        reason: code.to_owned().into(),
                    })))
                    .await;
                cause
            }
        };
        let _ = sink.close().await;
        if self.connection.close(cause) {
            counter!(WS_DISCONNECTIONS_TOTAL, "cause" => cause.as_str()).increment(1);
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &ServerFrame<'_>) -> Result<(), Exit>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let text = frame
        .encode()
        .map_err(|e| Exit::close(TransitionCause::StreamFailure, "ENCODING_ERROR", e.to_string()))?;
    sink.send(Message::Text(text.into())).await.map_err(|e| {
        debug!(error = %e, "socket write failed");
        Exit::Dropped
    })
}

async fn next_live(live: &mut Option<LiveQueue>) -> Option<Arc<EventEnvelope>> {
    match live {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

async fn grace_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

fn terminal_reason(envelope: &EventEnvelope) -> (&'static str, String) {
    match envelope.payload() {
        EventPayload::Error(p) if p.code == "SEQUENCE_EXHAUSTED" => ("SEQUENCE_EXHAUSTED", p.message.clone()),
        EventPayload::Error(p) => ("SESSION_TERMINATED", format!("{}: {}", p.code, p.message)),
        _ => ("SESSION_TERMINATED", "session ended".to_owned()),
    }
}

fn close_code_for(cause: TransitionCause) -> u16 {
    match cause {
        TransitionCause::ProtocolViolation => close_code::POLICY,
        TransitionCause::ServerShutdown => close_code::AWAY,
        TransitionCause::StreamFailure => close_code::ERROR,
        _ => close_code::NORMAL,
    }
}
