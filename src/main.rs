//! # Bastion Gateway Server
//!
//! A web bastion that proxies interactive remote-administration sessions
//! from browser clients to back-end servers. Shell sessions (SSH) run
//! through an upstream relay host; graphical sessions (RDP, VNC) are
//! tunneled through a Guacamole daemon. Browsers connect over WebSocket.
//!
//! ```text
//! Browser ──WS──► Gateway ──SSH──► Relay ──► Asset
//!                    └─────TCP──► guacd ──► Asset
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — frame discriminators and relay handshake records
//! - [`channels`] — the per-session queue bundle (the session bus)
//! - [`state`]    — shared state (session registry, monitor maps)
//! - [`policy`]   — per-asset access-time schedule evaluation
//! - [`ssh`]      — SSH relay connector
//! - [`guac`]     — Guacamole instruction codec and tunnel handshake
//! - [`guacd`]    — guacd connector
//! - [`handlers`] — session endpoints and WebSocket loops
//! - [`storage`]  — relational persistence (sessions, assets, accounts)
//! - [`api`]      — REST API endpoints
//! - [`i18n`]     — localized messages
//! - [`config`]   — TOML configuration
//! - [`error`]    — the typed error surface

mod api;
mod channels;
mod config;
mod error;
mod guac;
mod guacd;
mod handlers;
mod i18n;
mod policy;
mod protocol;
mod ssh;
mod state;
mod storage;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::i18n::Catalog;
use crate::state::AppState;

/// Server entry point.
///
/// Initializes logging, loads configuration, opens the database,
/// configures routes, and starts listening for incoming connections.
#[tokio::main]
async fn main() {
    // Initialize structured logging with env-filter support.
    // Default log level is `info` for the bastion_server crate.
    // Override with the `RUST_LOG` environment variable.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bastion_server=info".into()),
        )
        .init();

    let config = Config::load().expect("configuration");
    let messages = Catalog::load(
        config.i18n.bundle.as_deref(),
        config.i18n.default_lang.as_str(),
    );

    let db = sqlx::SqlitePool::connect(&config.database.dsn)
        .await
        .expect("database");
    storage::init_schema(&db).await.expect("database schema");

    let listen = config.server.listen.clone();
    let state = AppState::new(config, db, messages);

    // Build the Axum router with the session and REST endpoints
    let app = Router::new()
        .route(
            "/connect/{asset_id}/{account_id}/{protocol}",
            post(handlers::create_session),
        )
        .route("/connect/{session_id}", get(handlers::bind_session))
        .route(
            "/connect/monitor/{session_id}",
            get(handlers::monitor_session),
        )
        .route(
            "/connect/close/{session_id}",
            post(handlers::close_session),
        )
        .route("/api/sessions", get(api::list_sessions))
        .layer(CorsLayer::permissive())
        .with_state(state);

    info!("🔐 Bastion Gateway listening on {}", listen);

    let listener = tokio::net::TcpListener::bind(&listen).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
