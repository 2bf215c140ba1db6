//! WebSocket frame types.
//!
//! Every text frame is a JSON object tagged by `kind`. Envelopes travel
//! inside `event` frames; heartbeats and lifecycle notices are out-of-band
//! and carry no sequence number.

use chrono::{DateTime, Utc};
use docket_core::{ConnectionId, SessionId};
use docket_events::EventEnvelope;
use serde::{Deserialize, Serialize};

use crate::mode::StreamMode;

/// Server → client.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame<'a> {
    /// First frame after the upgrade.
    Connected {
        /// Assigned (or resumed) connection id; present it as `resume` to
        /// adopt this connection's cursor after a drop.
        connection_id: &'a ConnectionId,
        /// Session being streamed.
        session_id: &'a SessionId,
        /// Negotiated protocol version.
        protocol_version: u32,
        /// Source of the session's envelopes.
        mode: StreamMode,
        /// Highest sequence issued when the connection attached.
        latest_sequence: u64,
        /// Whether a parked connection was adopted.
        resumed: bool,
    },
    /// One sequenced envelope.
    Event {
        /// The envelope.
        envelope: &'a EventEnvelope,
    },
    /// Keepalive ping.
    Heartbeat {
        /// Server wall clock.
        server_time: DateTime<Utc>,
        /// Highest sequence issued so far.
        latest_sequence: u64,
    },
    /// The server is about to close the socket.
    Closing {
        /// Stable reason code.
        code: &'a str,
        /// Human-readable detail.
        reason: &'a str,
    },
}

impl ServerFrame<'_> {
    /// JSON text for a WebSocket text frame.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Client → server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// Everything up to and including `sequence` has been processed.
    Ack {
        /// Highest processed sequence.
        sequence: u64,
    },
    /// Client liveness pulse.
    Heartbeat,
    /// Orderly disconnect.
    Close,
}

impl ClientFrame {
    /// Parse one inbound text frame.
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn to_value(frame: &ServerFrame<'_>) -> Value {
        serde_json::from_str(&frame.encode().unwrap()).unwrap()
    }

    #[test]
    fn connected_frame_shape() {
        let cid = ConnectionId::parse("c-1").unwrap();
        let sid = SessionId::parse("job-1").unwrap();
        let v = to_value(&ServerFrame::Connected {
            connection_id: &cid,
            session_id: &sid,
            protocol_version: 2,
            mode: StreamMode::Live,
            latest_sequence: 9,
            resumed: false,
        });
        assert_eq!(
            v,
            json!({
                "kind": "connected",
                "connectionId": "c-1",
                "sessionId": "job-1",
                "protocolVersion": 2,
                "mode": "live",
                "latestSequence": 9,
                "resumed": false
            })
        );
    }

    #[test]
    fn event_frame_embeds_envelope() {
        let env = EventEnvelope::terminal_error(SessionId::parse("s").unwrap(), "X", "y");
        let v = to_value(&ServerFrame::Event { envelope: &env });
        assert_eq!(v["kind"], "event");
        assert_eq!(v["envelope"]["type"], "error");
        assert_eq!(v["envelope"]["data"]["code"], "X");
    }

    #[test]
    fn closing_frame_shape() {
        let v = to_value(&ServerFrame::Closing {
            code: "SEQUENCE_GAP",
            reason: "ack beyond delivered",
        });
        assert_eq!(v, json!({"kind": "closing", "code": "SEQUENCE_GAP", "reason": "ack beyond delivered"}));
    }

    #[test]
    fn client_frames_parse() {
        assert_eq!(
            ClientFrame::parse(r#"{"kind":"ack","sequence":42}"#).unwrap(),
            ClientFrame::Ack { sequence: 42 }
        );
        assert_eq!(ClientFrame::parse(r#"{"kind":"heartbeat"}"#).unwrap(), ClientFrame::Heartbeat);
        assert_eq!(ClientFrame::parse(r#"{"kind":"close"}"#).unwrap(), ClientFrame::Close);
    }

    #[test]
    fn malformed_client_frames_fail() {
        assert!(ClientFrame::parse("not json").is_err());
        assert!(ClientFrame::parse(r#"{"kind":"ack"}"#).is_err());
        assert!(ClientFrame::parse(r#"{"kind":"ack","sequence":-1}"#).is_err());
        assert!(ClientFrame::parse(r#"{"kind":"subscribe"}"#).is_err());
    }
}
