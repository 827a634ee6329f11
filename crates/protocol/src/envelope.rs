//! The wire envelope every message crosses the WebSocket in.
//!
//! Every frame, in both directions, is `{ type, payload, timestamp }`.
//! `ClientMessage`/`ServerMessage` are adjacently tagged so `type`/`payload`
//! stay sibling-but-separate keys on the wire, with `Envelope<M>` adding the
//! `timestamp` that every frame carries regardless of message kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wraps any client or server message with the `timestamp` field the wire
/// format requires on every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<M> {
    #[serde(flatten)]
    pub message: M,
    pub timestamp: DateTime<Utc>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            timestamp: Utc::now(),
        }
    }

    pub fn at(message: M, timestamp: DateTime<Utc>) -> Self {
        Self { message, timestamp }
    }
}

/// WebSocket close codes used by the connection manager.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const UNKNOWN_SESSION: u16 = 4404;
    pub const SESSION_OCCUPIED: u16 = 4409;
    pub const PROTOCOL_ERROR: u16 = 4422;
    pub const TAKEOVER: u16 = 4429;
    pub const SLOW_CONSUMER: u16 = 4430;
    pub const SERVER_ERROR: u16 = 4500;
}
