//! # Workspace Relay Coordinator
//!
//! The cloud-side hub of a distributed developer workspace. **Agents**
//! run on users' machines and keep an outbound WebSocket open; **browsers**
//! render the workspace UI and talk to their agents through this relay,
//! so agents never need inbound network reachability.
//!
//! ```text
//! Browser ──WS──► Relay ──WS──► Agent ──► terminals, files, git, …
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]  — message envelopes (JSON text frames, `"type"`-tagged)
//! - [`config`]    — environment-driven tunables
//! - [`auth`]      — cookie-token browser auth, first-message agent auth
//! - [`collab`]    — contracts consumed from the rest of the platform
//! - [`state`]     — the routing tables (user → browsers, user → agents)
//! - [`pending`]   — per-browser correlated-request registry
//! - [`browser`]   — browser acceptor and session loop
//! - [`agent`]     — agent acceptor and session loop
//! - [`heartbeat`] — agent liveness sweep
//!
//! The relay never interprets payloads: it routes envelopes and drops
//! them when the destination is gone. Nothing is persisted.

pub mod agent;
pub mod auth;
pub mod browser;
pub mod collab;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod pending;
pub mod protocol;
pub mod state;

use axum::http::StatusCode;
use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;

use crate::state::AppState;

/// Builds the upgrade router: one path per connection class. Any other
/// path is refused without performing a WebSocket upgrade.
pub fn router(state: AppState) -> Router {
    let config = state.config.clone();
    Router::new()
        .route(&config.browser_path, get(browser::ws_handler))
        .route(&config.agent_path, get(agent::ws_handler))
        .fallback(refuse)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn refuse() -> StatusCode {
    StatusCode::NOT_FOUND
}
