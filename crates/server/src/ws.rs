//! Axum WebSocket upgrade wiring — translates an HTTP upgrade request into
//! a running [`crate::connection::handle`] task.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::IntoResponse;

use crate::connection::{handle, ConnectionConfig, ConnectionDeps};
use crate::AppState;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let deps = ConnectionDeps {
            auth: state.auth.clone(),
            registry: state.registry.clone(),
            broker: state.broker.clone(),
            config: ConnectionConfig {
                ping_interval: state.config.ping_interval,
                idle_cutoff: state.config.idle_cutoff,
                auth_deadline: state.config.auth_deadline,
            },
        };
        handle(socket, deps).await;
    })
}
