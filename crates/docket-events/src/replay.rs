//! Reconnect resolution.
//!
//! Given a client's `last_acked` cursor and a session buffer, decide between
//! replaying the missing envelopes, asking for a full resync, or rejecting
//! the cursor outright. Decisions use sequence numbers only.

use std::sync::Arc;

use docket_core::SessionId;

use crate::buffer::EventBuffer;
use crate::envelope::EventEnvelope;
use crate::errors::{Result, StreamError};

/// Outcome of resolving a reconnect cursor.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplayPlan {
    /// Everything after the cursor is still retained. The vector may be
    /// empty when the client is already caught up.
    Replay(Vec<Arc<EventEnvelope>>),
    /// Part of the gap was evicted; the client needs a fresh snapshot.
    Resync {
        /// The cursor the client presented.
        last_acked: u64,
        /// Oldest sequence still retained.
        oldest_retained: u64,
        /// Latest sequence issued.
        latest_sequence: u64,
    },
}

/// Stateless resolver for reconnect cursors.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReplayController;

impl ReplayController {
    /// Resolve `last_acked` against `buffer`.
    ///
    /// # Errors
    ///
    /// [`StreamError::SequenceGap`] when the client claims a sequence that
    /// was never issued.
    pub fn resolve(
        session_id: &SessionId,
        buffer: &EventBuffer,
        last_acked: u64,
    ) -> Result<ReplayPlan> {
        let latest = buffer.latest_sequence();
        if last_acked > latest {
            return Err(StreamError::SequenceGap {
                session_id: session_id.clone(),
                claimed: last_acked,
                latest,
            });
        }

        let oldest = buffer.oldest_retained_sequence();
        // last_acked <= latest < u64::MAX, so the increment cannot overflow
        if last_acked + 1 < oldest {
            return Ok(ReplayPlan::Resync {
                last_acked,
                oldest_retained: oldest,
                latest_sequence: latest,
            });
        }

        Ok(ReplayPlan::Replay(buffer.range(last_acked + 1, latest)))
    }
}
