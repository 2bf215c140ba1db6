//! # docket-events
//!
//! The ordered, replayable heart of the streaming core.
//!
//! - [`envelope`]: [`EventEnvelope`] and the closed [`EventType`] set with
//!   per-type validated payloads
//! - [`sequence`]: [`SequenceGenerator`], gap-free numbering per session
//!   backed by a [`WatermarkStore`]
//! - [`buffer`]: [`EventBuffer`], the bounded retention window
//! - [`replay`]: [`ReplayController`], cursor resolution on reconnect
//! - [`stream`]: [`SessionStream`], one session's broadcaster
//! - [`hub`]: [`StreamHub`], the producer interface
//! - [`mock`]: [`MockScript`], the deterministic canned stream

#![deny(unsafe_code)]

pub mod buffer;
pub mod envelope;
pub mod errors;
pub mod hub;
pub mod mock;
pub mod replay;
pub mod sequence;
pub mod stream;
pub mod watermark;

pub use buffer::{EventBuffer, RetentionPolicy};
pub use envelope::{
    ErrorPayload, EventEnvelope, EventPayload, EventType, HeartbeatPayload, JobState,
    ProgressPayload, ResultPayload, ResyncPayload, StatusPayload,
};
pub use errors::{Result, StreamError};
pub use hub::{StreamConfig, StreamHub};
pub use mock::MockScript;
pub use replay::{ReplayController, ReplayPlan};
pub use sequence::SequenceGenerator;
pub use stream::{Attachment, ResyncRequest, SessionStream};
pub use watermark::{MemoryWatermarks, SqliteWatermarks, WatermarkStore};
