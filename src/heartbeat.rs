//! # Heartbeat Ticker
//!
//! Periodic liveness sweep over every connected agent. Each tick sends
//! an `agent:ping`; agents answer with `agent:pong`, which refreshes
//! their last-seen timestamp. An agent silent for more than
//! `heartbeat_max_missed` periods is told to close, which runs its
//! normal close handler (browsers see `agent:offline`, pending requests
//! targeting it are rejected).
//!
//! Browsers ping themselves at the application layer; the relay drives
//! no server-to-browser heartbeat.

use tokio::task::JoinHandle;
use tracing::warn;

use crate::protocol::{kind, Envelope};
use crate::state::{send_envelope, AppState, Outbound};

/// Spawns the ticker for the server's lifetime.
pub fn spawn(state: AppState) -> JoinHandle<()> {
    tokio::spawn(run(state))
}

async fn run(state: AppState) {
    let period = state.config.heartbeat_period;
    let dead_after_millis = period.as_millis() as i64 * state.config.heartbeat_max_missed as i64;
    let ping = Envelope::bare(kind::AGENT_PING);

    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        for agent in state.all_agents() {
            if agent.millis_since_alive() > dead_after_millis {
                warn!(
                    user_id = %agent.user_id,
                    agent_id = %agent.meta.agent_id,
                    "agent missed heartbeats, closing"
                );
                let _ = agent.tx.send(Outbound::Close);
            } else {
                send_envelope(&agent.tx, &ping);
            }
        }
    }
}
