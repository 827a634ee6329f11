//! Connection Manager — per-client state machine and the read/write
//! task pair backing one WebSocket connection.
//!
//! The socket is split into a reader and writer half; the writer drains
//! an `mpsc` inbox so a slow client can't stall the reader, and
//! `ClientMessage`s are translated into calls against shared state rather
//! than holding a lock across the whole connection.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use relay_protocol::{close_code, new_id, ClientMessage, Envelope, ServerMessage};
use tracing::{info, warn};

use crate::auth::{AuthError, AuthService};
use crate::broker::{Delivery, SubscriptionBroker};
use crate::registry::SessionRegistry;

pub struct ConnectionConfig {
    pub ping_interval: Duration,
    pub idle_cutoff: Duration,
    pub auth_deadline: Duration,
}

const MAX_FRAME_BYTES: usize = 1024 * 1024;
const MALFORMED_OFFENSE_LIMIT: u32 = 3;
const MALFORMED_OFFENSE_WINDOW: Duration = Duration::from_secs(10);

pub struct ConnectionDeps {
    pub auth: Arc<AuthService>,
    pub registry: Arc<SessionRegistry>,
    pub broker: Arc<SubscriptionBroker>,
    pub config: ConnectionConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Accepted,
    Authenticated { device_id: String },
    Streaming { device_id: String, session_id: String },
}

/// Drives one client connection end to end: handshake, auth, subscription
/// state machine, heartbeat, and clean teardown. Consumes the socket.
pub async fn handle(socket: WebSocket, deps: ConnectionDeps) {
    let client_id = new_id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (inbox_tx, mut inbox_rx) = tokio::sync::mpsc::channel::<Delivery>(1024);
    let mut revocations = deps.auth.subscribe_revocations();
    let mut broadcasts = deps.broker.subscribe_broadcasts();

    send(&mut ws_tx, ServerMessage::Connected {
        client_id: client_id.clone(),
        server_time: Utc::now(),
    }).await;

    let mut state = State::Accepted;
    let mut ping_interval = tokio::time::interval(deps.config.ping_interval);
    let auth_deadline = tokio::time::sleep(deps.config.auth_deadline);
    tokio::pin!(auth_deadline);
    let mut last_seen = tokio::time::Instant::now();
    let mut offenses: std::collections::VecDeque<tokio::time::Instant> = std::collections::VecDeque::new();

    let close = loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = tokio::time::Instant::now();
                        if text.len() > MAX_FRAME_BYTES {
                            warn!(component = "connection", event = "connection.oversized_frame", bytes = text.len());
                            break CloseOutcome { code: close_code::PROTOCOL_ERROR, reason: "frame too large".to_string() };
                        }
                        match serde_json::from_str::<Envelope<ClientMessage>>(&text) {
                            Ok(envelope) => {
                                if let Some(c) = handle_client_message(
                                    envelope.message,
                                    &mut state,
                                    &client_id,
                                    &deps,
                                    &inbox_tx,
                                    &mut ws_tx,
                                ).await {
                                    break c;
                                }
                            }
                            Err(e) => {
                                warn!(component = "connection", event = "connection.bad_frame", error = %e);
                                send(&mut ws_tx, ServerMessage::Error {
                                    code: "bad_request".to_string(),
                                    message: "could not parse message".to_string(),
                                }).await;

                                let now = tokio::time::Instant::now();
                                offenses.push_back(now);
                                while offenses.front().is_some_and(|t| now.duration_since(*t) > MALFORMED_OFFENSE_WINDOW) {
                                    offenses.pop_front();
                                }
                                if offenses.len() as u32 > MALFORMED_OFFENSE_LIMIT {
                                    break CloseOutcome { code: close_code::PROTOCOL_ERROR, reason: "too many malformed frames".to_string() };
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break CloseOutcome { code: close_code::NORMAL, reason: "client closed".to_string() };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(component = "connection", event = "connection.ws_error", error = %e);
                        break CloseOutcome { code: close_code::SERVER_ERROR, reason: "socket error".to_string() };
                    }
                }
            }
            delivery = inbox_rx.recv() => {
                match delivery {
                    Some(Delivery::Message(msg)) => send(&mut ws_tx, msg).await,
                    Some(Delivery::ForceClose { code, reason }) => {
                        send(&mut ws_tx, ServerMessage::Disconnecting { reason: reason.clone() }).await;
                        break CloseOutcome { code, reason };
                    }
                    None => break CloseOutcome { code: close_code::SERVER_ERROR, reason: "inbox closed".to_string() },
                }
            }
            _ = ping_interval.tick() => {
                if last_seen.elapsed() > deps.config.idle_cutoff {
                    break CloseOutcome { code: close_code::NORMAL, reason: "idle timeout".to_string() };
                }
                let _ = ws_tx.send(Message::Ping(Vec::new().into())).await;
            }
            revocation = revocations.recv() => {
                if let Ok(event) = revocation {
                    if let State::Authenticated { device_id } | State::Streaming { device_id, .. } = &state {
                        if matches_revoked_device(&deps, device_id, &event.key) {
                            break CloseOutcome { code: close_code::UNAUTHORIZED, reason: "credential revoked".to_string() };
                        }
                    }
                }
            }
            notification = broadcasts.recv() => {
                if let Ok(message) = notification {
                    if !matches!(state, State::Accepted) {
                        send(&mut ws_tx, message).await;
                    }
                }
            }
            _ = &mut auth_deadline => {
                if matches!(state, State::Accepted) {
                    break CloseOutcome { code: close_code::UNAUTHORIZED, reason: "authentication deadline expired".to_string() };
                }
                // Already authenticated by the time the deadline fired:
                // push it far out instead of re-polling an already-elapsed
                // `Sleep` on every remaining loop iteration.
                auth_deadline.as_mut().reset(tokio::time::Instant::now() + Duration::from_secs(365 * 24 * 3600));
            }
        }
    };

    if let State::Streaming { session_id, .. } = &state {
        deps.broker.unsubscribe(session_id, &client_id);
    }
    deps.broker.unsubscribe_client(&client_id);

    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: close.code,
            reason: close.reason.into(),
        })))
        .await;

    info!(component = "connection", event = "connection.closed", client_id = %client_id);
}

struct CloseOutcome {
    code: u16,
    reason: String,
}

/// Credentials are validated by key, not device id; a revocation event
/// only matches a connection if it was authenticated with that exact key.
/// The connection doesn't retain the raw key after authenticating (only
/// the device id), so this re-checks via the auth service's device lookup.
fn matches_revoked_device(deps: &ConnectionDeps, device_id: &str, revoked_key: &str) -> bool {
    deps.auth
        .info(revoked_key)
        .map(|info| info.device_id == device_id)
        .unwrap_or(false)
}

async fn handle_client_message(
    message: ClientMessage,
    state: &mut State,
    client_id: &str,
    deps: &ConnectionDeps,
    inbox_tx: &tokio::sync::mpsc::Sender<Delivery>,
    ws_tx: &mut (impl futures::Sink<Message> + Unpin),
) -> Option<CloseOutcome> {
    match message {
        ClientMessage::Authenticate { key, device_id: _ } => {
            match deps.auth.validate(&key) {
                Ok(info) => {
                    *state = State::Authenticated { device_id: info.device_id };
                    send(ws_tx, ServerMessage::Authenticated { success: true }).await;
                    None
                }
                Err(e) => {
                    send(ws_tx, ServerMessage::AuthenticationFailed { reason: reason_for(&e) }).await;
                    Some(CloseOutcome { code: close_code::UNAUTHORIZED, reason: reason_for(&e) })
                }
            }
        }
        ClientMessage::Subscribe { session_id, force } => {
            let device_id = match state {
                State::Accepted => {
                    return Some(CloseOutcome { code: close_code::UNAUTHORIZED, reason: "not authenticated".to_string() });
                }
                State::Authenticated { device_id } | State::Streaming { device_id, .. } => device_id.clone(),
            };

            if !deps.registry.exists(&session_id) {
                send(ws_tx, ServerMessage::Error {
                    code: "unknown_session".to_string(),
                    message: format!("no such session: {session_id}"),
                }).await;
                return None;
            }

            if let State::Streaming { session_id: prior, .. } = state {
                deps.broker.unsubscribe(prior, client_id);
            }

            match deps.broker.subscribe(&session_id, client_id, &device_id, force, inbox_tx.clone()) {
                crate::broker::SubscribeOutcome::Subscribed => {
                    *state = State::Streaming { device_id, session_id: session_id.clone() };
                    send(ws_tx, ServerMessage::Subscribed { session_id }).await;
                }
                crate::broker::SubscribeOutcome::Occupied { existing_device } => {
                    send(ws_tx, ServerMessage::SessionOccupied {
                        session_id,
                        existing_device,
                        can_take_over: true,
                    }).await;
                }
            }
            None
        }
        ClientMessage::Unsubscribe { .. } => {
            let detach = match state {
                State::Streaming { device_id, session_id } => Some((device_id.clone(), session_id.clone())),
                _ => None,
            };
            if let Some((device_id, session_id)) = detach {
                deps.broker.unsubscribe(&session_id, client_id);
                *state = State::Authenticated { device_id };
                send(ws_tx, ServerMessage::Unsubscribed { session_id }).await;
            }
            None
        }
        ClientMessage::Ping => {
            send(ws_tx, ServerMessage::Pong).await;
            None
        }
    }
}

fn reason_for(e: &AuthError) -> String {
    match e {
        AuthError::Unknown => "unknown credential".to_string(),
        AuthError::AlreadyConsumed => "token already used".to_string(),
        AuthError::Expired => "credential expired".to_string(),
        AuthError::Revoked => "credential revoked".to_string(),
    }
}

async fn send(ws_tx: &mut (impl futures::Sink<Message> + Unpin), message: ServerMessage) {
    let envelope = Envelope::new(message);
    if let Ok(json) = serde_json::to_string(&envelope) {
        let _ = ws_tx.send(Message::Text(json.into())).await;
    }
}
