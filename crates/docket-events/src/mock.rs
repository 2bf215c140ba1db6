//! Deterministic canned stream.
//!
//! Sessions resolved to mock mode are served from a fixed script instead of
//! a live producer: the same envelopes, sequence numbers, and timestamps on
//! every run. Cursors work exactly as they do for live sessions.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use docket_core::SessionId;
use serde_json::json;

use crate::envelope::{EventEnvelope, EventPayload, JobState};
use crate::errors::{Result, StreamError};

/// Fixed origin for mock timestamps: `2026-01-01T00:00:00Z`.
const MOCK_EPOCH_SECS: i64 = 1_767_225_600;

/// A scripted, replayable session.
#[derive(Clone, Debug)]
pub struct MockScript {
    session_id: SessionId,
    envelopes: Vec<Arc<EventEnvelope>>,
}

impl MockScript {
    /// The canned analysis job: queued, two staged passes with progress, a
    /// clause report, and completion.
    pub fn standard(session_id: &SessionId) -> Self {
        let mut payloads = vec![
            EventPayload::status("analysis", JobState::Queued),
            EventPayload::status("metadata_extraction", JobState::Running),
            EventPayload::progress("metadata_extraction", 50.0),
            EventPayload::progress("metadata_extraction", 100.0),
            EventPayload::status("clause_analysis", JobState::Running),
        ];
        payloads.extend(
            [25.0, 50.0, 75.0, 100.0]
                .into_iter()
                .map(|p| EventPayload::progress("clause_analysis", p)),
        );
        payloads.push(EventPayload::result(
            "clause_report",
            json!({
                "clauses": [
                    {"id": "indemnification", "risk": "high"},
                    {"id": "termination", "risk": "medium"},
                    {"id": "governing_law", "risk": "low"}
                ]
            }),
        ));
        payloads.push(EventPayload::status("analysis", JobState::Completed));
        Self::from_payloads(session_id, payloads)
    }

    /// Script the given payloads as sequences `1..=len`.
    pub fn from_payloads(session_id: &SessionId, payloads: Vec<EventPayload>) -> Self {
        let envelopes = payloads
            .into_iter()
            .zip(1_u64..)
            .map(|(payload, seq)| {
                Arc::new(EventEnvelope::seal(
                    seq,
                    session_id.clone(),
                    payload,
                    mock_time(seq),
                ))
            })
            .collect();
        Self {
            session_id: session_id.clone(),
            envelopes,
        }
    }

    /// Everything after `last_acked`.
    ///
    /// # Errors
    ///
    /// [`StreamError::SequenceGap`] when the cursor is past the end.
    pub fn envelopes_after(&self, last_acked: u64) -> Result<Vec<Arc<EventEnvelope>>> {
        let latest = self.latest_sequence();
        if last_acked > latest {
            return Err(StreamError::SequenceGap {
                session_id: self.session_id.clone(),
                claimed: last_acked,
                latest,
            });
        }
        let skip = usize::try_from(last_acked).unwrap_or(usize::MAX);
        Ok(self.envelopes.iter().skip(skip).cloned().collect())
    }

    /// Last scripted sequence.
    pub fn latest_sequence(&self) -> u64 {
        self.envelopes.len() as u64
    }
}

fn mock_time(seq: u64) -> DateTime<Utc> {
    let offset = i64::try_from(seq).unwrap_or(i64::MAX);
    DateTime::from_timestamp(MOCK_EPOCH_SECS, 0)
        .and_then(|epoch| epoch.checked_add_signed(TimeDelta::seconds(offset)))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;
    use assert_matches::assert_matches;

    fn sid() -> SessionId {
        SessionId::parse("mock-1").unwrap()
    }

    #[test]
    fn script_is_deterministic() {
        let a = MockScript::standard(&sid());
        let b = MockScript::standard(&sid());
        let ea: Vec<String> = a.envelopes_after(0).unwrap().iter().map(|e| e.encode().unwrap()).collect();
        let eb: Vec<String> = b.envelopes_after(0).unwrap().iter().map(|e| e.encode().unwrap()).collect();
        assert_eq!(ea, eb);
    }

    #[test]
    fn script_shape() {
        let s = MockScript::standard(&sid());
        let all = s.envelopes_after(0).unwrap();
        assert_eq!(all.len() as u64, s.latest_sequence());
        assert_eq!(all.first().unwrap().event_type(), EventType::Status);
        assert!(all.iter().any(|e| e.event_type() == EventType::Result));
        for (i, env) in all.iter().enumerate() {
            assert_eq!(env.sequence_number(), i as u64 + 1);
            env.payload().validate().unwrap();
        }
    }

    #[test]
    fn timestamps_start_at_fixed_epoch() {
        let s = MockScript::standard(&sid());
        let first = &s.envelopes_after(0).unwrap()[0];
        assert_eq!(first.emitted_at().to_rfc3339(), "2026-01-01T00:00:01+00:00");
    }

    #[test]
    fn cursor_is_honoured() {
        let s = MockScript::standard(&sid());
        let rest = s.envelopes_after(9).unwrap();
        assert_eq!(rest.first().unwrap().sequence_number(), 10);
        assert!(s.envelopes_after(s.latest_sequence()).unwrap().is_empty());
    }

    #[test]
    fn cursor_past_end_is_a_gap() {
        let s = MockScript::standard(&sid());
        assert_matches!(
            s.envelopes_after(s.latest_sequence() + 1),
            Err(StreamError::SequenceGap { .. })
        );
    }
}
