//! Relay server entry point.
//!
//! Initializes logging, loads the configuration, wires the default
//! collaborator set, starts the heartbeat ticker and serves the two
//! upgrade paths.

use relay_server::collab::Collaborators;
use relay_server::config::RelayConfig;
use relay_server::state::AppState;
use relay_server::{heartbeat, router};
use tracing::info;

#[tokio::main]
async fn main() {
    // Structured logging with env-filter support. Default level is
    // `info` for this crate; override with `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_server=info".into()),
        )
        .init();

    let config = RelayConfig::from_env();
    if config.dev_bypass() {
        info!("no identity provider configured, development bypass active");
    }
    let collab = Collaborators::from_config(&config);
    let state = AppState::new(config, collab);

    // Liveness sweep over connected agents, for the process lifetime.
    heartbeat::spawn(state.clone());

    let addr = state.config.listen_addr;
    let app = router(state);
    info!("🛰 Relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
