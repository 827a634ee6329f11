//! Relay server entry point: CLI dispatch, process wiring, and the axum
//! HTTP/WS server. Subcommand dispatch happens before the tokio runtime
//! starts; `async_main` builds the component graph, the router, and
//! serves with graceful shutdown.

mod auth;
mod broker;
mod classifier;
mod config;
mod connection;
mod http;
mod logging;
mod paths;
mod record;
mod registry;
mod tailer;
mod watcher;
mod ws;
#[cfg(test)]
mod scenarios;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use auth::AuthService;
use broker::SubscriptionBroker;
use classifier::Classifier;
use config::{Cli, Command, Config};
use registry::SessionRegistry;

/// Shared application state handed to every axum handler and every
/// connection task via `Arc`.
pub struct AppState {
    pub config: Config,
    pub auth: Arc<AuthService>,
    pub registry: Arc<SessionRegistry>,
    pub classifier: Arc<Classifier>,
    pub broker: Arc<SubscriptionBroker>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::resolve(&cli)?;
    paths::init_data_dir(config.data_dir.as_deref());

    match cli.command {
        Some(Command::Pair) => {
            paths::ensure_dirs()?;
            let runtime = tokio::runtime::Runtime::new()?;
            return runtime.block_on(run_pair(config));
        }
        Some(Command::Status) => {
            let runtime = tokio::runtime::Runtime::new()?;
            return runtime.block_on(run_status(config));
        }
        Some(Command::Start) | None => {}
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async_main(config))
}

/// `relay-server pair` — mint a one-shot enrollment token and print it as
/// both a scannable terminal QR code and a plain URL, without starting the
/// server.
async fn run_pair(config: Config) -> anyhow::Result<()> {
    let auth = AuthService::new(config.enrollment_ttl, config.credential_ttl);
    let issued = auth.issue_enrollment();
    let enroll_url = format!("{}/enroll?token={}", config.public_base_url, issued.token);

    match qrcode::QrCode::new(enroll_url.as_bytes()) {
        Ok(code) => {
            let rendered = code
                .render::<qrcode::render::unicode::Dense1x2>()
                .build();
            println!("{rendered}");
        }
        Err(e) => tracing::warn!(component = "pair", event = "pair.qr_render_failed", error = %e),
    }

    println!("enrollment url: {enroll_url}");
    println!("expires at: {}", issued.expires_at);
    Ok(())
}

/// `relay-server status` — check whether the configured bind address is
/// currently accepting connections.
async fn run_status(config: Config) -> anyhow::Result<()> {
    let url = format!("http://{}/health", config.bind_addr);
    match tokio::net::TcpStream::connect(config.bind_addr).await {
        Ok(_) => println!("relay-server appears to be listening on {}", config.bind_addr),
        Err(e) => println!("relay-server not reachable at {url}: {e}"),
    }
    Ok(())
}

async fn async_main(config: Config) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let _logging = logging::init_logging()?;

    let root = config.root.clone();
    let bind_addr = config.bind_addr;
    let poll_watcher = config.poll_watcher;

    let auth = Arc::new(AuthService::new(config.enrollment_ttl, config.credential_ttl));
    let registry = Arc::new(SessionRegistry::new());
    let classifier = Arc::new(Classifier::new(config.idle_threshold));
    let broker = Arc::new(SubscriptionBroker::new(config.history_buffer));

    let state = Arc::new(AppState {
        config,
        auth: auth.clone(),
        registry: registry.clone(),
        classifier: classifier.clone(),
        broker: broker.clone(),
    });

    let pipeline = watcher::Pipeline {
        registry: registry.clone(),
        classifier: classifier.clone(),
        broker: broker.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = watcher::run(root, poll_watcher, pipeline).await {
            tracing::error!(component = "watcher", event = "watcher.fatal", error = %e);
        }
    });

    let sweep_auth = auth.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            sweep_auth.sweep();
        }
    });

    let idle_classifier = classifier.clone();
    let idle_registry = registry.clone();
    let idle_broker = broker.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now();
            for (session_id, activity_state) in idle_classifier.tick_idle(now) {
                idle_registry.set_status(&session_id, relay_protocol::DescriptorStatus::Idle);
                idle_broker.publish_message(
                    &session_id,
                    relay_protocol::ServerMessage::SessionState {
                        session_id: session_id.clone(),
                        state: activity_state,
                        last_activity: None,
                    },
                );
            }
        }
    });

    let app = Router::new()
        .route("/ws", get(ws::upgrade))
        .merge(http::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(
        component = "server",
        event = "server.listening",
        bind_address = %bind_addr,
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(component = "server", event = "server.shutdown");
}
