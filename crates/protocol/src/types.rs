//! Core data types shared across the protocol: the parsed record, the
//! session descriptor the directory watcher maintains, and the handful of
//! auth-surface DTOs the HTTP layer returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who produced a [`Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

/// A single parsed line from a session's JSONL transcript.
///
/// `parent_id` and `cwd` default to the empty string when the source line
/// omits them — the parser never invents an `Option` the wire format
/// doesn't have a clean absence-marker for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub parent_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cwd: String,
}

/// Lifecycle status of a session as tracked by the directory watcher /
/// session registry. Distinct from [`ActivityState`], which is the
/// classifier's finer-grained working/waiting/idle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorStatus {
    Discovered,
    Active,
    Idle,
    Terminated,
}

/// Classifier-derived activity state for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Working,
    Waiting,
    Idle,
}

/// Summary of a session for list views (`GET /api/sessions`, and the
/// `session_notification` wire message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_label: String,
    pub status: DescriptorStatus,
    pub record_count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Public view of a device credential — never includes the key itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCredentialInfo {
    pub device_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}
