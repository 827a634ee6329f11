//! Session Registry — the authoritative in-memory record of every
//! session the directory watcher has discovered.
//!
//! A `DashMap` keyed by session id gives per-key fine-grained locking
//! without a global mutex, plus a `broadcast::Sender` for list-level
//! fan-out to anything subscribed to the full session list.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_protocol::{DescriptorStatus, SessionSummary};
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Discovered(SessionSummary),
    Updated(SessionSummary),
    Terminated { session_id: String },
}

struct Descriptor {
    session_id: String,
    project_label: String,
    status: DescriptorStatus,
    record_count: u64,
    first_seen: DateTime<Utc>,
    last_activity: Option<DateTime<Utc>>,
}

impl From<&Descriptor> for SessionSummary {
    fn from(d: &Descriptor) -> Self {
        SessionSummary {
            session_id: d.session_id.clone(),
            project_label: d.project_label.clone(),
            status: d.status,
            record_count: d.record_count,
            first_seen: d.first_seen,
            last_activity: d.last_activity,
        }
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, Descriptor>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            sessions: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register a newly discovered session file. No-op if already known.
    /// Returns `true` iff this call actually inserted a new descriptor, so
    /// callers can tell a first sighting apart from a watcher rescan.
    pub fn discover(&self, session_id: &str, project_label: &str) -> bool {
        if self.sessions.contains_key(session_id) {
            return false;
        }
        let now = Utc::now();
        let descriptor = Descriptor {
            session_id: session_id.to_string(),
            project_label: project_label.to_string(),
            status: DescriptorStatus::Discovered,
            record_count: 0,
            first_seen: now,
            last_activity: None,
        };
        let summary = SessionSummary::from(&descriptor);
        self.sessions.insert(session_id.to_string(), descriptor);
        let _ = self.events.send(RegistryEvent::Discovered(summary));
        true
    }

    /// Record that a record was observed for a session, bumping its
    /// activity timestamp and count and transitioning discovered→active.
    pub fn mark_record(&self, session_id: &str, at: DateTime<Utc>) {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        entry.record_count += 1;
        entry.last_activity = Some(at);
        if entry.status == DescriptorStatus::Discovered {
            entry.status = DescriptorStatus::Active;
        }
        let summary = SessionSummary::from(&*entry);
        drop(entry);
        let _ = self.events.send(RegistryEvent::Updated(summary));
    }

    /// Update the coarse lifecycle status (e.g. Active -> Idle from the
    /// classifier's idle sweep).
    pub fn set_status(&self, session_id: &str, status: DescriptorStatus) {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        if entry.status == status {
            return;
        }
        entry.status = status;
        let summary = SessionSummary::from(&*entry);
        drop(entry);
        let _ = self.events.send(RegistryEvent::Updated(summary));
    }

    /// Mark a session terminated (its file disappeared). The descriptor is
    /// kept, not removed, so `/api/sessions` still lists it.
    pub fn mark_terminated(&self, session_id: &str) {
        let Some(mut entry) = self.sessions.get_mut(session_id) else {
            return;
        };
        entry.status = DescriptorStatus::Terminated;
        drop(entry);
        let _ = self.events.send(RegistryEvent::Terminated {
            session_id: session_id.to_string(),
        });
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionSummary> {
        self.sessions.get(session_id).map(|d| SessionSummary::from(&*d))
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        self.sessions.iter().map(|e| SessionSummary::from(e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_is_idempotent() {
        let registry = SessionRegistry::new();
        assert!(registry.discover("s1", "proj"));
        assert!(!registry.discover("s1", "proj"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn mark_record_transitions_discovered_to_active() {
        let registry = SessionRegistry::new();
        registry.discover("s1", "proj");
        assert_eq!(registry.get("s1").unwrap().status, DescriptorStatus::Discovered);
        registry.mark_record("s1", Utc::now());
        assert_eq!(registry.get("s1").unwrap().status, DescriptorStatus::Active);
        assert_eq!(registry.get("s1").unwrap().record_count, 1);
    }

    #[test]
    fn terminated_session_stays_listed() {
        let registry = SessionRegistry::new();
        registry.discover("s1", "proj");
        registry.mark_terminated("s1");
        let summary = registry.get("s1").unwrap();
        assert_eq!(summary.status, DescriptorStatus::Terminated);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn events_are_broadcast_on_discover() {
        let registry = SessionRegistry::new();
        let mut rx = registry.subscribe();
        registry.discover("s1", "proj");
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, RegistryEvent::Discovered(_)));
    }
}
