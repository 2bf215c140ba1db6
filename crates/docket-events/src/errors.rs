//! Error types for the stream core.
//!
//! [`StreamError`] covers every failure the core can report after admission.
//! `RESYNC_REQUIRED` is deliberately absent: a client falling outside the
//! retention window is an expected outcome, modelled as
//! [`ReplayPlan::Resync`](crate::replay::ReplayPlan::Resync).

use docket_core::SessionId;
use thiserror::Error;

/// Errors raised by envelope construction, sequencing, and replay.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A payload did not match the shape its event type requires, or a wire
    /// envelope could not be decoded. Fatal for that emission only.
    #[error("encoding error ({event_type}): {reason}")]
    Encoding {
        /// Declared event type (or `"unknown"` when undecodable).
        event_type: String,
        /// What was wrong.
        reason: String,
    },

    /// The session's sequence space is used up. Fatal for the session.
    #[error("sequence exhausted for session {session_id}")]
    SequenceExhausted {
        /// The terminated session.
        session_id: SessionId,
    },

    /// A client claimed to have seen a sequence number that was never issued.
    #[error("sequence gap: client acked {claimed} but session {session_id} is at {latest}")]
    SequenceGap {
        /// The session the client attached to.
        session_id: SessionId,
        /// The sequence number the client claimed.
        claimed: u64,
        /// The highest number actually issued.
        latest: u64,
    },

    /// An envelope was appended out of order. Indicates a bug upstream.
    #[error("non-contiguous append: expected sequence {expected}, got {actual}")]
    NonContiguous {
        /// The next sequence number the buffer expected.
        expected: u64,
        /// The sequence number that was offered.
        actual: u64,
    },

    /// The session already terminated; nothing more can be emitted or attached.
    #[error("session {0} has terminated")]
    SessionTerminated(SessionId),

    /// The high-water-mark store failed; the number was not issued.
    #[error("watermark store error: {0}")]
    Watermark(#[from] rusqlite::Error),
}

impl StreamError {
    /// Build an encoding error for the given event type.
    pub fn encoding(event_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Encoding {
            event_type: event_type.into(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Encoding { .. } => "ENCODING_ERROR",
            Self::SequenceExhausted { .. } => "SEQUENCE_EXHAUSTED",
            Self::SequenceGap { .. } => "SEQUENCE_GAP",
            Self::NonContiguous { .. } => "NON_CONTIGUOUS",
            Self::SessionTerminated(_) => "SESSION_TERMINATED",
            Self::Watermark(_) => "WATERMARK_ERROR",
        }
    }

    /// Whether a connection seeing this error must close.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Self::SequenceExhausted { .. } | Self::SequenceGap { .. } | Self::SessionTerminated(_)
        )
    }
}

/// Convenience type alias for stream results.
pub type Result<T> = std::result::Result<T, StreamError>;
