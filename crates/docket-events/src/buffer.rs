//! Bounded per-session retention window.
//!
//! The buffer keeps the most recent envelopes of one session in sequence
//! order. Entries leave only from the front, by count or by age, so the
//! retained window is always contiguous: a hole can exist only below
//! [`EventBuffer::oldest_retained_sequence`], never inside the window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use docket_core::constants::FIRST_SEQUENCE;

use crate::envelope::EventEnvelope;
use crate::errors::{Result, StreamError};

/// Eviction bounds. Whichever is hit first wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Maximum number of retained envelopes (N).
    pub max_events: usize,
    /// Maximum age of a retained envelope (T).
    pub max_age: Duration,
}

impl RetentionPolicy {
    /// Count bound only; age is effectively unbounded.
    pub fn count(max_events: usize) -> Self {
        Self {
            max_events,
            max_age: Duration::from_secs(u64::from(u32::MAX)),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_events: 1000,
            max_age: Duration::from_secs(900),
        }
    }
}

/// Ordered, bounded window of one session's most recent envelopes.
#[derive(Debug)]
pub struct EventBuffer {
    max_events: usize,
    max_age: TimeDelta,
    entries: VecDeque<Arc<EventEnvelope>>,
    /// Sequence the next append must carry.
    next_expected: u64,
}

impl EventBuffer {
    /// Empty buffer for a session that has issued nothing yet.
    pub fn new(policy: RetentionPolicy) -> Self {
        Self::starting_after(policy, FIRST_SEQUENCE - 1)
    }

    /// Empty buffer for a session whose generator already issued up to
    /// `last_issued` (e.g. resumed from a watermark). Everything at or below
    /// it counts as evicted.
    pub fn starting_after(policy: RetentionPolicy, last_issued: u64) -> Self {
        Self {
            max_events: policy.max_events.max(1),
            max_age: TimeDelta::from_std(policy.max_age).unwrap_or(TimeDelta::MAX),
            entries: VecDeque::with_capacity(policy.max_events.min(1024)),
            next_expected: last_issued.saturating_add(1),
        }
    }

    /// Append the next envelope and apply the eviction bounds.
    ///
    /// Returns how many envelopes were evicted.
    ///
    /// # Errors
    ///
    /// [`StreamError::NonContiguous`] if the envelope is not exactly the
    /// next sequence number. Terminal envelopes are never retained.
    pub fn append(&mut self, envelope: Arc<EventEnvelope>) -> Result<usize> {
        let actual = envelope.sequence_number();
        if envelope.is_terminal() || actual != self.next_expected {
            return Err(StreamError::NonContiguous {
                expected: self.next_expected,
                actual,
            });
        }
        self.entries.push_back(envelope);
        self.next_expected = actual + 1;

        let mut evicted = 0;
        while self.entries.len() > self.max_events {
            let _ = self.entries.pop_front();
            evicted += 1;
        }
        Ok(evicted + self.evict_expired(Utc::now()))
    }

    /// Drop entries older than the age bound as of `now`.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now.checked_sub_signed(self.max_age);
        let Some(cutoff) = cutoff else { return 0 };
        let mut evicted = 0;
        while self
            .entries
            .front()
            .is_some_and(|e| e.emitted_at() < cutoff)
        {
            let _ = self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Retained envelopes with `from <= sequence <= to`, in order.
    ///
    /// Bounds are clamped to the retained window; a range entirely outside
    /// it yields an empty vector.
    pub fn range(&self, from: u64, to: u64) -> Vec<Arc<EventEnvelope>> {
        let oldest = self.oldest_retained_sequence();
        let from = from.max(oldest);
        let to = to.min(self.latest_sequence());
        if self.entries.is_empty() || from > to {
            return Vec::new();
        }
        // window is contiguous, so offsets are direct indices
        let start = usize::try_from(from - oldest).unwrap_or(usize::MAX);
        let len = usize::try_from(to - from + 1).unwrap_or(usize::MAX);
        self.entries.iter().skip(start).take(len).cloned().collect()
    }

    /// Sequence of the oldest retained envelope. When nothing is retained
    /// this is one past the latest issued number.
    pub fn oldest_retained_sequence(&self) -> u64 {
        self.entries
            .front()
            .map_or(self.next_expected, |e| e.sequence_number())
    }

    /// Highest sequence appended so far, `0` if none.
    pub fn latest_sequence(&self) -> u64 {
        self.next_expected - 1
    }

    /// Number of retained envelopes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventPayload;
    use assert_matches::assert_matches;
    use docket_core::SessionId;

    fn env_at(seq: u64, at: DateTime<Utc>) -> Arc<EventEnvelope> {
        Arc::new(EventEnvelope::seal(
            seq,
            SessionId::parse("s").unwrap(),
            EventPayload::progress("stage", 1.0),
            at,
        ))
    }

    fn env(seq: u64) -> Arc<EventEnvelope> {
        env_at(seq, Utc::now())
    }

    fn filled(n: u64, bound: usize) -> EventBuffer {
        let mut buf = EventBuffer::new(RetentionPolicy::count(bound));
        for seq in 1..=n {
            let _ = buf.append(env(seq)).unwrap();
        }
        buf
    }

    fn seqs(v: &[Arc<EventEnvelope>]) -> Vec<u64> {
        v.iter().map(|e| e.sequence_number()).collect()
    }

    #[test]
    fn empty_buffer_boundaries() {
        let buf = EventBuffer::new(RetentionPolicy::default());
        assert!(buf.is_empty());
        assert_eq!(buf.latest_sequence(), 0);
        assert_eq!(buf.oldest_retained_sequence(), 1);
        assert!(buf.range(1, 10).is_empty());
    }

    #[test]
    fn count_bound_keeps_most_recent() {
        let buf = filled(100, 20);
        assert_eq!(buf.len(), 20);
        assert_eq!(buf.oldest_retained_sequence(), 81);
        assert_eq!(buf.latest_sequence(), 100);
    }

    #[test]
    fn n_plus_one_evicts_the_first() {
        let buf = filled(21, 20);
        assert!(buf.range(1, 1).is_empty());
        assert_eq!(seqs(&buf.range(2, 2)), vec![2]);
    }

    #[test]
    fn range_is_clamped_to_window() {
        let buf = filled(100, 20);
        assert_eq!(seqs(&buf.range(86, 100)), (86..=100).collect::<Vec<_>>());
        assert_eq!(seqs(&buf.range(1, 83)), vec![81, 82, 83]);
        assert_eq!(seqs(&buf.range(99, 500)), vec![99, 100]);
        assert!(buf.range(1, 80).is_empty());
        assert!(buf.range(101, 200).is_empty());
        assert!(buf.range(90, 85).is_empty());
    }

    #[test]
    fn rejects_out_of_order_append() {
        let mut buf = filled(3, 10);
        assert_matches!(
            buf.append(env(5)),
            Err(StreamError::NonContiguous { expected: 4, actual: 5 })
        );
        assert_matches!(buf.append(env(3)), Err(StreamError::NonContiguous { .. }));
        let _ = buf.append(env(4)).unwrap();
    }

    #[test]
    fn rejects_terminal_envelope() {
        let mut buf = EventBuffer::new(RetentionPolicy::default());
        let terminal = Arc::new(EventEnvelope::terminal_error(
            SessionId::parse("s").unwrap(),
            "X",
            "y",
        ));
        assert!(buf.append(terminal).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn age_bound_evicts_from_the_front() {
        let mut buf = EventBuffer::new(RetentionPolicy {
            max_events: 100,
            max_age: Duration::from_secs(60),
        });
        let now = Utc::now();
        let _ = buf.append(env_at(1, now - TimeDelta::seconds(300))).unwrap();
        let _ = buf.append(env_at(2, now - TimeDelta::seconds(30))).unwrap();
        let _ = buf.append(env_at(3, now)).unwrap();
        // seq 1 went out with the append of 1 itself (older than T)
        assert_eq!(buf.oldest_retained_sequence(), 2);

        assert_eq!(buf.evict_expired(now + TimeDelta::seconds(45)), 1);
        assert_eq!(buf.oldest_retained_sequence(), 3);
        assert_eq!(buf.evict_expired(now + TimeDelta::seconds(120)), 1);
        assert!(buf.is_empty());
        assert_eq!(buf.oldest_retained_sequence(), 4);
        assert_eq!(buf.latest_sequence(), 3);
    }

    #[test]
    fn starting_after_resumes_numbering() {
        let mut buf = EventBuffer::starting_after(RetentionPolicy::default(), 41);
        assert_eq!(buf.oldest_retained_sequence(), 42);
        assert_eq!(buf.latest_sequence(), 41);
        assert!(buf.append(env(1)).is_err());
        let _ = buf.append(env(42)).unwrap();
        assert_eq!(buf.oldest_retained_sequence(), 42);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn window_is_contiguous_and_bounded(n in 0u64..200, bound in 1usize..50) {
                let buf = filled(n, bound);
                let all = buf.range(0, u64::MAX - 1);
                prop_assert!(all.len() <= bound);
                prop_assert_eq!(all.len(), buf.len());
                for pair in all.windows(2) {
                    prop_assert_eq!(pair[0].sequence_number() + 1, pair[1].sequence_number());
                }
                if let Some(last) = all.last() {
                    prop_assert_eq!(last.sequence_number(), n);
                    prop_assert_eq!(all[0].sequence_number(), buf.oldest_retained_sequence());
                }
            }

            #[test]
            fn range_matches_filter(n in 1u64..150, bound in 1usize..40, a in 0u64..160, b in 0u64..160) {
                let buf = filled(n, bound);
                let got = seqs(&buf.range(a, b));
                let oldest = buf.oldest_retained_sequence();
                let want: Vec<u64> = (oldest..=n).filter(|s| *s >= a && *s <= b).collect();
                prop_assert_eq!(got, want);
            }
        }
    }
}
