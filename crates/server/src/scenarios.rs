//! End-to-end scenario tests driving the component graph directly through
//! its public handles rather than through the network stack. Each test is
//! one of the six literal scenarios this system is built to satisfy.

use std::time::Duration;

use relay_protocol::{close_code, ActivityState, Role, ServerMessage};

use crate::auth::{AuthError, AuthService};
use crate::broker::{Delivery, SubscriptionBroker};
use crate::classifier::Classifier;
use crate::record;
use crate::registry::SessionRegistry;
use crate::tailer::{TailEvent, Tailer};

fn drain(rx: &mut tokio::sync::mpsc::Receiver<Delivery>) -> Vec<Delivery> {
    let mut out = Vec::new();
    while let Ok(d) = rx.try_recv() {
        out.push(d);
    }
    out
}

#[tokio::test]
async fn scenario_1_pairing_happy_path() {
    let auth = AuthService::new(Duration::from_secs(30), Duration::from_secs(2_592_000));

    let issued = auth.issue_enrollment();
    assert!(issued.expires_at > chrono::Utc::now());

    let minted = auth.redeem_enrollment(&issued.token, Some("d1".to_string())).unwrap();
    assert!(auth.validate(&minted.key).is_ok());

    let second = auth.redeem_enrollment(&issued.token, None).unwrap_err();
    assert_eq!(second, AuthError::AlreadyConsumed);
}

#[tokio::test]
async fn scenario_2_single_line_tail_delivers_message_then_state() {
    let registry = SessionRegistry::new();
    let classifier = Classifier::new(Duration::from_secs(600));
    let broker = SubscriptionBroker::new(0);

    registry.discover("S1", "proj");
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    broker.subscribe("S1", "c1", "d1", false, tx);
    drain(&mut rx); // history_start / history_end from the empty prelude

    let line = r#"{"sessionId":"S1","type":"user","message":{"role":"user","content":"hi"},"timestamp":"2025-09-14T15:04:35.357Z","cwd":"/p"}"#;
    let parsed = record::parse(line).unwrap().unwrap();

    registry.mark_record("S1", parsed.created_at);
    let new_state = classifier.on_record("S1", parsed.role, parsed.created_at);
    broker.publish_record("S1", parsed.clone(), false);
    if let Some(state) = new_state {
        broker.publish_message(
            "S1",
            ServerMessage::SessionState {
                session_id: "S1".to_string(),
                state,
                last_activity: Some(parsed.created_at),
            },
        );
    }

    let events = drain(&mut rx);
    assert!(matches!(
        events[0],
        Delivery::Message(ServerMessage::SessionMessage { historical: false, .. })
    ));
    if let Delivery::Message(ServerMessage::SessionMessage { ref role, ref content, .. }) = events[0] {
        assert_eq!(*role, Role::User);
        assert_eq!(content, "hi");
    }
    assert!(matches!(
        events[1],
        Delivery::Message(ServerMessage::SessionState { state: ActivityState::Working, .. })
    ));
}

#[tokio::test]
async fn scenario_3_truncation_does_not_duplicate_or_drop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("S1.jsonl");

    let line = |content: &str| {
        format!(
            r#"{{"sessionId":"S1","message":{{"role":"user","content":"{content}"}},"timestamp":"2026-01-01T00:00:00Z"}}"#
        )
    };
    std::fs::write(&path, format!("{}\n{}\n", line("a"), line("b"))).unwrap();

    let mut tailer = Tailer::new(path.clone(), "S1".to_string());
    let first = tailer.poll().unwrap();
    let record_count = first.iter().filter(|e| matches!(e, TailEvent::Record { .. })).count();
    assert_eq!(record_count, 2);

    std::fs::write(&path, "").unwrap();
    let truncated = tailer.poll().unwrap();
    assert!(truncated.iter().any(|e| matches!(e, TailEvent::Truncated)));
    assert!(!truncated.iter().any(|e| matches!(e, TailEvent::Record { .. })));

    std::fs::write(&path, format!("{}\n", line("c"))).unwrap();
    let after = tailer.poll().unwrap();
    let new_records: Vec<_> = after
        .iter()
        .filter_map(|e| match e {
            TailEvent::Record { record, .. } => Some(record.content.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(new_records, vec!["c".to_string()]);
}

#[tokio::test]
async fn scenario_4_takeover_evicts_prior_subscriber() {
    let broker = SubscriptionBroker::new(0);

    let (tx_a, mut rx_a) = tokio::sync::mpsc::channel(16);
    let outcome_a = broker.subscribe("S1", "client-a", "A", false, tx_a);
    assert_eq!(outcome_a, crate::broker::SubscribeOutcome::Subscribed);
    drain(&mut rx_a);

    let (tx_b, mut rx_b) = tokio::sync::mpsc::channel(16);
    let occupied = broker.subscribe("S1", "client-b", "B", false, tx_b.clone());
    assert_eq!(
        occupied,
        crate::broker::SubscribeOutcome::Occupied { existing_device: "A".to_string() }
    );
    // A is undisturbed: a probe publish still reaches it.
    broker.publish_message(
        "S1",
        ServerMessage::SessionState { session_id: "S1".to_string(), state: ActivityState::Working, last_activity: None },
    );
    assert!(!drain(&mut rx_a).is_empty());

    let forced = broker.subscribe("S1", "client-b", "B", true, tx_b);
    assert_eq!(forced, crate::broker::SubscribeOutcome::Subscribed);

    let a_events = drain(&mut rx_a);
    assert!(a_events.iter().any(|d| matches!(
        d,
        Delivery::Message(ServerMessage::SessionTakenOver { new_device, .. }) if new_device == "B"
    )));
    assert!(a_events.iter().any(|d| matches!(d, Delivery::ForceClose { code, .. } if *code == close_code::TAKEOVER)));

    assert_eq!(broker.current_device("S1"), Some("B".to_string()));
    let b_events = drain(&mut rx_b);
    assert!(b_events.iter().any(|d| matches!(d, Delivery::Message(ServerMessage::SessionHistoryStart { .. }))));
}

#[tokio::test]
async fn scenario_5_idle_classification_then_immediate_recovery() {
    let classifier = Classifier::new(Duration::from_secs(600)); // 10 minute threshold
    let t0 = chrono::Utc::now();

    classifier.seed("S1", Role::Assistant, t0);
    assert_eq!(classifier.current("S1"), Some(ActivityState::Waiting));

    // t0 + 9 minutes: still waiting, not yet idle.
    let nine_min = t0 + chrono::Duration::minutes(9);
    assert!(classifier.tick_idle(nine_min).is_empty());
    assert_eq!(classifier.current("S1"), Some(ActivityState::Waiting));

    // t0 + 10 minutes + 1 second: idle threshold crossed.
    let past_threshold = t0 + chrono::Duration::minutes(10) + chrono::Duration::seconds(1);
    let changed = classifier.tick_idle(past_threshold);
    assert_eq!(changed, vec![("S1".to_string(), ActivityState::Idle)]);

    // A fresh user record recovers immediately, bypassing the sweep.
    let recovered = classifier.on_record("S1", Role::User, past_threshold + chrono::Duration::seconds(1));
    assert_eq!(recovered, Some(ActivityState::Working));
}

#[tokio::test]
async fn scenario_6_enrollment_expires_at_ttl_boundary() {
    // Scaled down to keep the test fast; the boundary relationship
    // (redeem after TTL elapses fails as `Expired`) is what's under test,
    // not the literal wall-clock duration.
    let auth = AuthService::new(Duration::from_millis(20), Duration::from_secs(2_592_000));
    let issued = auth.issue_enrollment();

    tokio::time::sleep(Duration::from_millis(40)).await;

    let err = auth.redeem_enrollment(&issued.token, None).unwrap_err();
    assert_eq!(err, AuthError::Expired);
}
