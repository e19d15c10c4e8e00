//! WebSocket sessions: state machine, write serialization, heartbeat, registry.

pub mod handler;
pub mod heartbeat;
pub mod registry;
pub mod session;
pub mod writer;
