//! WebSocket connection lifecycle.
//!
//! - [`state`]: the INITIALIZING / ACTIVE / DEGRADED / CLOSED machine
//! - [`connection`]: per-connection cursor and liveness
//! - [`frames`]: the JSON frames exchanged on the socket
//! - [`heartbeat`]: the keepalive ticker
//! - [`parked`]: dropped connections awaiting resume
//! - [`handler`]: the push loop tying them together

pub mod connection;
pub mod frames;
pub mod handler;
pub mod heartbeat;
pub mod parked;
pub mod state;

pub use connection::Connection;
pub use frames::{ClientFrame, ServerFrame};
pub use handler::{ConnectionHandler, StreamSource};
pub use heartbeat::{KeepaliveExit, KeepaliveSignal, run_keepalive};
pub use parked::ParkedConnections;
pub use state::{ConnectionState, IllegalTransition, StateMachine, TransitionCause};
