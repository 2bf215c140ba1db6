//! # docket-server
//!
//! Axum surface for the streaming core: admission ahead of the WebSocket
//! upgrade, one push loop per connection, keepalive, and resume.
//!
//! - [`admission`]: auth, rate limit, and version gates
//! - [`websocket`]: connection state machine and push loop
//! - [`server`]: [`DocketServer`] and its routes
//! - [`mode`]: live vs. mock selection per session

#![deny(unsafe_code)]

pub mod admission;
pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod mode;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use admission::{AdmissionChain, AdmissionError, AuthError, ConnectionAttempt, Identity};
pub use config::{KeepaliveConfig, ServerConfig};
pub use errors::ServerError;
pub use mode::{ModeSelector, StreamMode};
pub use server::{AppState, DocketServer};
pub use shutdown::ShutdownCoordinator;
