//! Server → client messages, carried inside an [`crate::Envelope`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActivityState, DescriptorStatus, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame sent on every accepted connection, before authentication.
    Connected {
        client_id: String,
        server_time: DateTime<Utc>,
    },
    Authenticated {
        success: bool,
    },
    AuthenticationFailed {
        reason: String,
    },
    Subscribed {
        session_id: String,
    },
    /// A viewer already holds this session; `can_take_over` is always
    /// `true` today (cooperative takeover has no policy that forbids it),
    /// but is carried on the wire so a future policy can say otherwise.
    SessionOccupied {
        session_id: String,
        existing_device: String,
        can_take_over: bool,
    },
    /// Sent to the previous viewer when a takeover evicts them.
    SessionTakenOver {
        session_id: String,
        new_device: String,
    },
    Unsubscribed {
        session_id: String,
    },
    SessionMessage {
        session_id: String,
        role: Role,
        content: String,
        parent_id: String,
        /// `true` for records replayed as part of the subscribe-time
        /// history prelude, `false` for records observed live.
        historical: bool,
    },
    /// Classifier-derived working/waiting/idle signal.
    SessionState {
        session_id: String,
        state: ActivityState,
        last_activity: Option<DateTime<Utc>>,
    },
    /// Coarse lifecycle status (discovered/active/idle/terminated).
    SessionStatus {
        session_id: String,
        status: DescriptorStatus,
    },
    SessionHistoryStart {
        session_id: String,
    },
    SessionHistoryEnd {
        session_id: String,
    },
    SessionTerminated {
        session_id: String,
        reason: String,
    },
    /// Fanned out to every authenticated client subscribed to the session
    /// list, independent of any per-session subscription.
    SessionNotification {
        kind: String,
        session_id: String,
        project_label: String,
    },
    Pong,
    Error {
        code: String,
        message: String,
    },
    /// Sent immediately before the server closes the socket, carrying the
    /// human-readable reason that accompanies the close code.
    Disconnecting {
        reason: String,
    },
}
