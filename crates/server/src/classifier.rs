//! State Classifier — derives the working/waiting/idle activity signal
//! from record roles and elapsed time.
//!
//! A user record means the agent is about to work; an assistant record
//! means it's waiting on the user. Idle is time-based and only detected by
//! the periodic sweep, since nothing else would notice the absence of
//! activity. State lives behind a `DashMap` keyed by session id rather
//! than a single `Mutex<HashMap<..>>`, so sessions never contend with
//! each other over one lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_protocol::{ActivityState, Role};

pub struct Classifier {
    states: DashMap<String, (ActivityState, DateTime<Utc>)>,
    idle_threshold: Duration,
}

impl Classifier {
    pub fn new(idle_threshold: Duration) -> Self {
        Self {
            states: DashMap::new(),
            idle_threshold,
        }
    }

    /// Called for every record observed live (not for historical replay —
    /// historical records shouldn't flip a freshly discovered session's
    /// activity state away from whatever its most recent line implies).
    ///
    /// Returns the new state if it changed. A session's first classified
    /// record is always a change, since there's no prior state to compare
    /// against.
    pub fn on_record(&self, session_id: &str, role: Role, at: DateTime<Utc>) -> Option<ActivityState> {
        let new_state = match role {
            Role::User => ActivityState::Working,
            Role::Assistant => ActivityState::Waiting,
        };

        match self.states.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert((new_state, at));
                Some(new_state)
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                let (state, last_at) = *occupied.get();
                if last_at > at && state != new_state {
                    // An out-of-order historical record arriving after a
                    // later live one; don't regress the state.
                    return None;
                }
                let changed = state != new_state;
                occupied.insert((new_state, at));
                changed.then_some(new_state)
            }
        }
    }

    /// Seed state from a historical record without counting it as a live
    /// transition (no change event emitted).
    pub fn seed(&self, session_id: &str, role: Role, at: DateTime<Utc>) {
        let state = match role {
            Role::User => ActivityState::Working,
            Role::Assistant => ActivityState::Waiting,
        };
        self.states.insert(session_id.to_string(), (state, at));
    }

    /// Periodic idle sweep: any session whose last activity predates the
    /// idle threshold and isn't already `Idle` transitions there.
    pub fn tick_idle(&self, now: DateTime<Utc>) -> Vec<(String, ActivityState)> {
        let mut changed = Vec::new();
        for mut entry in self.states.iter_mut() {
            let (state, last_activity) = *entry.value();
            if state == ActivityState::Idle {
                continue;
            }
            let elapsed = now.signed_duration_since(last_activity);
            if elapsed.to_std().unwrap_or_default() >= self.idle_threshold {
                entry.value_mut().0 = ActivityState::Idle;
                changed.push((entry.key().clone(), ActivityState::Idle));
            }
        }
        changed
    }

    pub fn current(&self, session_id: &str) -> Option<ActivityState> {
        self.states.get(session_id).map(|e| e.0)
    }
}
