//! Electrum-style server client.
//!
//! Speaks newline-delimited JSON-RPC over TCP, TLS or WebSocket. A
//! [`Connection`] owns one socket and reports replies, notifications and
//! failures as [`ConnectionEvent`]s; deciding what to ask for is left to the
//! sync engine.

/// Connection actor and its handle
mod connection;
/// Byte transports
pub mod transport;
/// Wire frames, tasks and decoded results
mod types;

pub use connection::{Connection, ConnectionEvents, ConnectionHandle, ConnectionState};
pub use types::*;
