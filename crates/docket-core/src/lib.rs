//! # docket-core
//!
//! Shared vocabulary for the docket streaming core.
//!
//! - **Branded IDs**: [`SessionId`] and [`ConnectionId`] as newtypes so a
//!   connection ID can never be passed where a session ID is expected
//! - **Constants**: protocol header names and reserved sequence values
//! - **Logging**: `tracing` subscriber bootstrap and an in-memory capture
//!   layer for tests

#![deny(unsafe_code)]

pub mod constants;
pub mod ids;
pub mod logging;

pub use ids::{ConnectionId, InvalidId, SessionId};
