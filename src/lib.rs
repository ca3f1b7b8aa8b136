//! Parley Relay
//!
//! A WebSocket chat server that provides:
//!
//! 1. **Accounts**: username/password identities registered over HTTP and
//!    authenticated per connection, with a short lockout after repeated
//!    failures.
//!
//! 2. **Presence**: who is online right now, broadcast to every connected
//!    client whenever it changes.
//!
//! 3. **Delivery**: one-to-one text and image messages pushed live to an
//!    online recipient, or held in a pending queue and replayed (oldest
//!    first) when the recipient next logs in. Pending messages expire after a
//!    configurable TTL.

pub mod accounts;
pub mod error;
pub mod handler;
pub mod lockout;
pub mod notify;
pub mod presence;
pub mod protocol;
pub mod router;
pub mod session;
pub mod state;
pub mod store;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use error::{RelayError, Result};
pub use state::{RelayConfig, RelayState};

/// Build the HTTP router: `/ws`, `/register`, `/health`, `/stats`.
pub fn app(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/register", post(accounts::register_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.max_message_size(state.config.max_frame_bytes)
        .max_frame_size(state.config.max_frame_bytes)
        .on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "parley-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    let archived = state.messages.archive_count().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Could not count archived messages");
        0
    });

    Json(json!({
        "online_clients": state.online_count(),
        "offline_queue_size": state.offline_queue_size(),
        "archived_messages": archived,
        "archive_enabled": state.config.archive_messages,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
