//! Echo server.
//!
//! - `session`: per-peer rate tracking and the connection registry
//! - `tcp`: readiness multiplexer for stream peers
//! - `udp`: datagram echo keyed by peer address

pub mod session;
pub mod tcp;
pub mod udp;
