//! Per-session monotonic sequence numbers.
//!
//! Numbers start at
//! [`FIRST_SEQUENCE`](docket_core::constants::FIRST_SEQUENCE) and increase by exactly one. Each
//! number is persisted to the [`WatermarkStore`] before it is returned, so
//! a restart never reissues one. Past [`MAX_ISSUABLE_SEQUENCE`] the session
//! is exhausted; there is no wraparound.
//!
//! Concurrent callers for the same session are serialized by a per-session
//! mutex. Different sessions never contend beyond the brief map lookup; a
//! session's first watermark read happens outside the map lock.

use std::collections::HashMap;
use std::sync::Arc;

use docket_core::SessionId;
use docket_core::constants::MAX_ISSUABLE_SEQUENCE;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::errors::{Result, StreamError};
use crate::watermark::WatermarkStore;

/// Issues gap-free, strictly increasing numbers per session.
pub struct SequenceGenerator {
    store: Arc<dyn WatermarkStore>,
    counters: Mutex<HashMap<SessionId, Arc<Mutex<u64>>>>,
}

impl SequenceGenerator {
    /// Generator backed by `store`.
    pub fn new(store: Arc<dyn WatermarkStore>) -> Self {
        Self {
            store,
            counters: Mutex::new(HashMap::new()),
        }
    }

    fn counter(&self, session_id: &SessionId) -> Result<Arc<Mutex<u64>>> {
        if let Some(c) = self.counters.lock().get(session_id) {
            return Ok(Arc::clone(c));
        }
        // the store read runs without the map lock; a racing loader for the
        // same session reads the same mark and the first insert wins
        let resumed = self.store.load(session_id)?;
        let mut counters = self.counters.lock();
        let counter = counters
            .entry(session_id.clone())
            .or_insert_with(|| {
                if resumed > 0 {
                    debug!(session_id = %session_id, last_issued = resumed, "resuming sequence from watermark");
                }
                Arc::new(Mutex::new(resumed))
            });
        Ok(Arc::clone(counter))
    }

    /// Issue the next number for `session_id`.
    ///
    /// # Errors
    ///
    /// [`StreamError::SequenceExhausted`] once [`MAX_ISSUABLE_SEQUENCE`] has
    /// been issued, or [`StreamError::Watermark`] if the mark could not be
    /// persisted (the number is then not issued).
    pub fn next(&self, session_id: &SessionId) -> Result<u64> {
        let counter = self.counter(session_id)?;
        let mut last = counter.lock();
        if *last >= MAX_ISSUABLE_SEQUENCE {
            error!(session_id = %session_id, "sequence space exhausted");
            return Err(StreamError::SequenceExhausted {
                session_id: session_id.clone(),
            });
        }
        let next = *last + 1;
        self.store.persist(session_id, next)?;
        *last = next;
        counter!("stream_sequences_issued_total").increment(1);
        Ok(next)
    }

    /// The last number issued for `session_id`, or `0` if none.
    pub fn current(&self, session_id: &SessionId) -> Result<u64> {
        let counter = self.counter(session_id)?;
        let last = *counter.lock();
        Ok(last)
    }

    /// Drop the in-memory counter. The watermark stays, so a later call
    /// resumes where this one stopped.
    pub fn release(&self, session_id: &SessionId) {
        let _ = self.counters.lock().remove(session_id);
    }

    /// Drop the counter and its persisted watermark.
    pub fn forget(&self, session_id: &SessionId) -> Result<()> {
        self.release(session_id);
        self.store.remove(session_id)
    }
}
