//! Event envelopes: the immutable, sequenced unit pushed to clients.
//!
//! An [`EventEnvelope`] can only be created two ways inside a running
//! server: by a [`SessionStream`](crate::stream::SessionStream) at emission
//! time (which assigns the sequence number), or as a terminal error carrying
//! the reserved [`TERMINAL_SEQUENCE`]. Clients rebuild envelopes from the
//! wire with [`EventEnvelope::decode`], which re-validates the payload
//! against its declared type.
//!
//! Wire form (self-describing; `type` selects the `data` schema):
//!
//! ```json
//! {"sequence":7,"type":"progress","sessionId":"job-42",
//!  "emittedAt":"2026-03-01T10:00:00Z","data":{"stage":"clause_analysis","percent":40.0}}
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use docket_core::constants::TERMINAL_SEQUENCE;
use docket_core::{ConnectionId, SessionId};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::errors::{Result, StreamError};

/// Closed set of event kinds a session can carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Coarse job lifecycle change (queued, running, completed, ...).
    Status,
    /// Fine-grained progress within a stage.
    Progress,
    /// A finished artifact or partial result.
    Result,
    /// Producer liveness pulse for long-running stages.
    Heartbeat,
    /// A producer-side or terminal error.
    Error,
    /// The client's gap exceeded the retention window; a snapshot follows.
    ResyncRequired,
}

impl EventType {
    /// Every variant, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Status,
        Self::Progress,
        Self::Result,
        Self::Heartbeat,
        Self::Error,
        Self::ResyncRequired,
    ];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Progress => "progress",
            Self::Result => "result",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::ResyncRequired => "resync_required",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of the backend job behind a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not started.
    Queued,
    /// In progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped on request.
    Cancelled,
}

/// Payload of a `status` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusPayload {
    /// Stage name, e.g. `"metadata_extraction"`.
    pub stage: String,
    /// New job state.
    pub state: JobState,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of a `progress` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProgressPayload {
    /// Stage name.
    pub stage: String,
    /// Completion within the stage, `0.0..=100.0`.
    pub percent: f64,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Payload of a `result` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResultPayload {
    /// Artifact kind, e.g. `"clause_report"`.
    pub kind: String,
    /// Producer-defined result body.
    #[serde(default)]
    pub body: Value,
}

/// Payload of a `heartbeat` event (always `{}`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatPayload {}

/// Payload of an `error` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the stream ends after this event.
    #[serde(default)]
    pub fatal: bool,
}

/// Payload of a `resync_required` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResyncPayload {
    /// The cursor the client presented.
    pub last_acked: u64,
    /// Oldest sequence still retained when the resync was issued.
    pub oldest_retained: u64,
    /// Latest sequence issued before this envelope.
    pub latest_sequence: u64,
    /// The connection the resync is addressed to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<ConnectionId>,
}

/// A validated payload. The variant determines the envelope's event type,
/// so type and payload can never disagree.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    /// `status`
    Status(StatusPayload),
    /// `progress`
    Progress(ProgressPayload),
    /// `result`
    Result(ResultPayload),
    /// `heartbeat`
    Heartbeat(HeartbeatPayload),
    /// `error`
    Error(ErrorPayload),
    /// `resync_required`
    ResyncRequired(ResyncPayload),
}

impl EventPayload {
    /// Shorthand for a `status` payload.
    pub fn status(stage: impl Into<String>, state: JobState) -> Self {
        Self::Status(StatusPayload {
            stage: stage.into(),
            state,
            message: None,
        })
    }

    /// Shorthand for a `progress` payload.
    pub fn progress(stage: impl Into<String>, percent: f64) -> Self {
        Self::Progress(ProgressPayload {
            stage: stage.into(),
            percent,
            message: None,
        })
    }

    /// Shorthand for a `result` payload.
    pub fn result(kind: impl Into<String>, body: Value) -> Self {
        Self::Result(ResultPayload {
            kind: kind.into(),
            body,
        })
    }

    /// Shorthand for a `heartbeat` payload.
    pub fn heartbeat() -> Self {
        Self::Heartbeat(HeartbeatPayload {})
    }

    /// Shorthand for an `error` payload.
    pub fn error(code: impl Into<String>, message: impl Into<String>, fatal: bool) -> Self {
        Self::Error(ErrorPayload {
            code: code.into(),
            message: message.into(),
            fatal,
        })
    }

    /// The event type this payload belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Status(_) => EventType::Status,
            Self::Progress(_) => EventType::Progress,
            Self::Result(_) => EventType::Result,
            Self::Heartbeat(_) => EventType::Heartbeat,
            Self::Error(_) => EventType::Error,
            Self::ResyncRequired(_) => EventType::ResyncRequired,
        }
    }

    /// Parse and validate raw JSON as the payload of `event_type`.
    ///
    /// Unknown fields, missing fields, wrong types, and out-of-range values
    /// are all [`StreamError::Encoding`]; nothing is coerced.
    pub fn from_value(event_type: EventType, data: Value) -> Result<Self> {
        let parsed = match event_type {
            EventType::Status => serde_json::from_value(data).map(Self::Status),
            EventType::Progress => serde_json::from_value(data).map(Self::Progress),
            EventType::Result => serde_json::from_value(data).map(Self::Result),
            EventType::Heartbeat => serde_json::from_value(data).map(Self::Heartbeat),
            EventType::Error => serde_json::from_value(data).map(Self::Error),
            EventType::ResyncRequired => serde_json::from_value(data).map(Self::ResyncRequired),
        };
        let payload =
            parsed.map_err(|e| StreamError::encoding(event_type.as_str(), e.to_string()))?;
        payload.validate()?;
        Ok(payload)
    }

    /// Check value-level constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: &str| Err(StreamError::encoding(self.event_type().as_str(), reason));
        match self {
            Self::Status(p) if p.stage.trim().is_empty() => fail("stage must not be empty"),
            Self::Progress(p) if p.stage.trim().is_empty() => fail("stage must not be empty"),
            Self::Progress(p) if !p.percent.is_finite() || !(0.0..=100.0).contains(&p.percent) => {
                fail("percent must be a finite number in 0..=100")
            }
            Self::Result(p) if p.kind.trim().is_empty() => fail("kind must not be empty"),
            Self::Error(p) if p.code.trim().is_empty() => fail("code must not be empty"),
            Self::ResyncRequired(p) if p.last_acked >= p.oldest_retained => {
                fail("lastAcked must precede oldestRetained")
            }
            _ => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// One immutable, sequenced unit of pushed data.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "WireEnvelope")]
pub struct EventEnvelope {
    sequence_number: u64,
    session_id: SessionId,
    emitted_at: DateTime<Utc>,
    payload: EventPayload,
}

impl EventEnvelope {
    /// Stamp a validated payload. Only the session stream calls this, right
    /// after drawing `sequence_number` from the generator.
    pub(crate) fn seal(
        sequence_number: u64,
        session_id: SessionId,
        payload: EventPayload,
        emitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence_number,
            session_id,
            emitted_at,
            payload,
        }
    }

    /// A fatal `error` envelope that ends a connection.
    ///
    /// Carries [`TERMINAL_SEQUENCE`], which the generator never issues, so it
    /// cannot collide with a real event and still sorts last.
    pub fn terminal_error(
        session_id: SessionId,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::seal(
            TERMINAL_SEQUENCE,
            session_id,
            EventPayload::error(code, message, true),
            Utc::now(),
        )
    }

    /// Position of this envelope in its session.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// The session this envelope belongs to.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Wall-clock emission time. Observability and retention age only; never
    /// used for ordering.
    pub fn emitted_at(&self) -> DateTime<Utc> {
        self.emitted_at
    }

    /// The event type.
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// The validated payload.
    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Whether this is a connection-ending terminal envelope.
    pub fn is_terminal(&self) -> bool {
        self.sequence_number == TERMINAL_SEQUENCE
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| StreamError::encoding(self.event_type().as_str(), e.to_string()))
    }

    /// Parse and validate the JSON wire form.
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StreamError::encoding("unknown", e.to_string()))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelopeRef<'a> {
    sequence: u64,
    #[serde(rename = "type")]
    event_type: EventType,
    session_id: &'a SessionId,
    emitted_at: &'a DateTime<Utc>,
    data: &'a EventPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct WireEnvelope {
    sequence: u64,
    #[serde(rename = "type")]
    event_type: EventType,
    session_id: SessionId,
    emitted_at: DateTime<Utc>,
    data: Value,
}

impl Serialize for EventEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        WireEnvelopeRef {
            sequence: self.sequence_number,
            event_type: self.event_type(),
            session_id: &self.session_id,
            emitted_at: &self.emitted_at,
            data: &self.payload,
        }
        .serialize(serializer)
    }
}

impl TryFrom<WireEnvelope> for EventEnvelope {
    type Error = StreamError;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        let payload = EventPayload::from_value(wire.event_type, wire.data)?;
        Ok(Self::seal(
            wire.sequence,
            wire.session_id,
            payload,
            wire.emitted_at,
        ))
    }
}
