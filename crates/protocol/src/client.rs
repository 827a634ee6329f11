//! Client → server messages, carried inside an [`crate::Envelope`].
//!
//! Adjacently tagged (`type` + `payload`) so every frame matches the
//! `{type, payload, timestamp}` wire envelope.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on every connection. `device_id` is omitted only for
    /// the legacy single-credential-per-key case; callers should send it
    /// whenever they have one.
    Authenticate {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
    /// Attach to a session's live stream. `force` requests a takeover if
    /// another viewer already holds the session.
    Subscribe {
        session_id: String,
        #[serde(default)]
        force: bool,
    },
    /// Detach from the currently subscribed session. `session_id` is
    /// accepted for clarity but the connection only ever holds one
    /// subscription at a time.
    Unsubscribe {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Client-initiated heartbeat; the server replies with `pong`.
    Ping,
}
