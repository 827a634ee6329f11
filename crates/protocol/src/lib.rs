//! Relay protocol — shared wire types for the relay server and its clients.
//!
//! This crate has no I/O and no async runtime dependency: it is pure data
//! and `serde` glue, imported by the server binary and, in principle, by
//! any client implementation.

use uuid::Uuid;

pub mod client;
pub mod envelope;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use envelope::{close_code, Envelope};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique id (session ids, client ids, device ids, ...).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
