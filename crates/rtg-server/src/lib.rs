//! # rtg-server
//!
//! Per-connection session lifecycle for the real-time gateway.
//!
//! - Connection acceptor: HTTP upgrade on `/ws`, origin check, size limits
//! - Sessions: forward-only state machine, read loop, close reasons
//! - Write serializer: one in-flight write per connection, each under a deadline
//! - Heartbeat monitor: ping cadence and pong deadline per session
//! - Session registry and shutdown coordinator: bounded drain of every open session
//! - Prometheus metrics and `/healthz`

#![deny(unsafe_code)]

pub mod config;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{Limits, OriginPolicy, ServerConfig};
pub use errors::ServerError;
pub use server::GatewayServer;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
