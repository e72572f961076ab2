//! # Routing Tables
//!
//! The only process-wide mutable state: who is connected, and on whose
//! behalf. Three registries, all keyed for multi-tenancy:
//!
//! - **Browser table**: user id → set of live browser connections
//! - **Agent table**: user id → agent id → live agent record
//! - **In-flight table**: relay-scoped request id → route back to the
//!   issuing browser
//!
//! All registries use [`DashMap`] for concurrent access from the many
//! session tasks; write operations on a user's entry are serialised by
//! the per-key lock. Fan-out always iterates over a snapshot so no lock
//! is held while pushing into a peer's write queue.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::collab::Collaborators;
use crate::config::RelayConfig;
use crate::pending::PendingRequests;
use crate::protocol::{AgentDescriptor, Envelope};

/// Type alias for the unbounded sender feeding a connection's outbound
/// write loop. Each connected peer gets one of these.
pub type ClientTx = mpsc::UnboundedSender<Outbound>;

/// What a session's write loop is asked to do next.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Send a serialised JSON text frame.
    Frame(String),
    /// Send a close frame and shut the connection down. Used for
    /// supersession eviction and heartbeat-declared death.
    Close,
}

/// Serialises an envelope and queues it on a peer's write loop.
/// A full-channel error means the peer is closing; the frame is dropped.
pub fn send_envelope(tx: &ClientTx, envelope: &Envelope) {
    match serde_json::to_string(envelope) {
        Ok(text) => {
            let _ = tx.send(Outbound::Frame(text));
        }
        Err(e) => error!("serialize error: {}", e),
    }
}

/// Milliseconds since the Unix epoch, for liveness bookkeeping.
pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ─── Records ────────────────────────────────────────────────────

/// A live browser connection. Browsers are anonymous within their user
/// set; the id exists only for routing responses back.
#[derive(Clone)]
pub struct BrowserHandle {
    /// Queue into this browser's write loop.
    pub tx: ClientTx,

    /// The browser's pending-request registry. Owned by the session;
    /// shared here so agent sessions can resolve entries.
    pub pending: Arc<PendingRequests>,
}

/// A live agent connection plus the identity it declared in `agent:auth`.
#[derive(Clone)]
pub struct AgentHandle {
    /// Unique per TCP connection. A reconnect under the same `agent_id`
    /// produces a new `conn_id`, which is how stale close handlers are
    /// told apart from the record they would otherwise remove.
    pub conn_id: String,

    /// The tenant this agent belongs to. Immutable for the connection's
    /// lifetime.
    pub user_id: String,

    /// Queue into this agent's write loop.
    pub tx: ClientTx,

    /// Declared metadata, replaced wholesale on reconnect.
    pub meta: AgentDescriptor,

    /// Unix-millis timestamp of the last `agent:pong` (or of connect).
    last_pong: Arc<AtomicI64>,
}

impl AgentHandle {
    pub fn new(user_id: &str, tx: ClientTx, meta: AgentDescriptor) -> Self {
        Self {
            conn_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            tx,
            meta,
            last_pong: Arc::new(AtomicI64::new(unix_millis())),
        }
    }

    /// Records a liveness signal from the agent.
    pub fn mark_alive(&self) {
        self.last_pong.store(unix_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the agent last proved it was alive.
    pub fn millis_since_alive(&self) -> i64 {
        unix_millis() - self.last_pong.load(Ordering::Relaxed)
    }
}

/// Route back to the browser that issued a correlated request. Keyed by
/// the relay-scoped id stamped on the envelope before it is forwarded
/// to the agent, because correlation ids are only unique per browser.
#[derive(Debug, Clone)]
pub struct InflightRoute {
    pub user_id: String,
    pub browser_id: String,
    pub agent_id: String,
    /// The browser's original correlation id, restored before delivery.
    pub correlation_id: String,
}

// ─── Shared State ───────────────────────────────────────────────

/// Shared application state, cloned into each connection handler.
/// Lifetime is the server process; nothing here survives a restart.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub collab: Collaborators,
    browsers: Arc<DashMap<String, HashMap<String, BrowserHandle>>>,
    agents: Arc<DashMap<String, HashMap<String, AgentHandle>>>,
    inflight: Arc<DashMap<String, InflightRoute>>,
}

impl AppState {
    pub fn new(config: RelayConfig, collab: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            collab,
            browsers: Arc::new(DashMap::new()),
            agents: Arc::new(DashMap::new()),
            inflight: Arc::new(DashMap::new()),
        }
    }

    // ── Browser registry ──

    pub fn register_browser(&self, user_id: &str, browser_id: &str, handle: BrowserHandle) {
        self.browsers
            .entry(user_id.to_string())
            .or_default()
            .insert(browser_id.to_string(), handle);
    }

    pub fn unregister_browser(&self, user_id: &str, browser_id: &str) {
        if let Some(mut entry) = self.browsers.get_mut(user_id) {
            entry.remove(browser_id);
            let empty = entry.is_empty();
            drop(entry);
            if empty {
                self.browsers.remove_if(user_id, |_, set| set.is_empty());
            }
        }
    }

    pub fn browser_of(&self, user_id: &str, browser_id: &str) -> Option<BrowserHandle> {
        self.browsers.get(user_id)?.get(browser_id).cloned()
    }

    /// Snapshot of a user's browsers, for fan-out. The registry lock is
    /// released before the caller touches any write queue.
    pub fn browsers_of(&self, user_id: &str) -> Vec<BrowserHandle> {
        self.browsers
            .get(user_id)
            .map(|set| set.values().cloned().collect())
            .unwrap_or_default()
    }

    // ── Agent registry ──

    /// Installs an agent record. A prior record for the same
    /// `(user_id, agent_id)` is superseded: its connection is told to
    /// close, its pending requests are rejected, and browsers see
    /// `agent:offline` for the old identity before `agent:online` for
    /// the new one. The per-user entry lock is held across the swap and
    /// both notifications so the events cannot interleave with another
    /// registration.
    pub fn register_agent(&self, handle: AgentHandle) {
        let user_id = handle.user_id.clone();
        let agent_id = handle.meta.agent_id.clone();
        let descriptor = handle.meta.clone();

        let mut entry = self.agents.entry(user_id.clone()).or_default();
        let evicted = entry.insert(agent_id.clone(), handle);
        if let Some(old) = evicted {
            info!(user_id = %user_id, agent_id = %agent_id, "agent superseded");
            let _ = old.tx.send(Outbound::Close);
            self.notify_agent_offline(&user_id, &agent_id);
        }
        info!(
            user_id = %user_id,
            agent_id = %agent_id,
            hostname = %descriptor.hostname,
            "agent online"
        );
        self.push_to_user_browsers(&user_id, &Envelope::agent_online(&descriptor));
    }

    /// Removes an agent record, but only if it still belongs to the
    /// closing connection — a superseded connection's close handler
    /// must not take the replacement down with it.
    pub fn unregister_agent(&self, user_id: &str, agent_id: &str, conn_id: &str) {
        let removed = {
            let Some(mut entry) = self.agents.get_mut(user_id) else {
                return;
            };
            let owns = entry
                .get(agent_id)
                .map_or(false, |current| current.conn_id == conn_id);
            if owns {
                entry.remove(agent_id);
            }
            let empty = entry.is_empty();
            drop(entry);
            if owns && empty {
                self.agents.remove_if(user_id, |_, set| set.is_empty());
            }
            owns
        };
        if removed {
            info!(user_id = %user_id, agent_id = %agent_id, "agent offline");
            self.notify_agent_offline(user_id, agent_id);
        }
    }

    /// Lookup for targeted routing. `None` when the agent is absent —
    /// including when the caller's user does not own it.
    pub fn agent_of(&self, user_id: &str, agent_id: &str) -> Option<AgentHandle> {
        self.agents.get(user_id)?.get(agent_id).cloned()
    }

    /// Snapshot of every live agent, for the heartbeat sweep.
    pub fn all_agents(&self) -> Vec<AgentHandle> {
        self.agents
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Metadata snapshot of a user's agents, for the `agents:list`
    /// greeting.
    pub fn agents_snapshot(&self, user_id: &str) -> Vec<AgentDescriptor> {
        self.agents
            .get(user_id)
            .map(|set| set.values().map(|a| a.meta.clone()).collect())
            .unwrap_or_default()
    }

    /// Exposed to co-resident subsystems.
    pub fn is_agent_online(&self, user_id: &str, agent_id: &str) -> bool {
        self.agents
            .get(user_id)
            .map(|set| set.contains_key(agent_id))
            .unwrap_or(false)
    }

    /// Fans one envelope out to every browser of a user. Serialised
    /// once; delivery is best-effort per browser.
    pub fn push_to_user_browsers(&self, user_id: &str, envelope: &Envelope) {
        match serde_json::to_string(envelope) {
            Ok(text) => {
                for browser in self.browsers_of(user_id) {
                    let _ = browser.tx.send(Outbound::Frame(text.clone()));
                }
            }
            Err(e) => error!("serialize error: {}", e),
        }
    }

    /// Fans a raw inbound frame out unmodified — the lossless path for
    /// agent-originated messages the relay does not interpret.
    pub fn forward_to_user_browsers(&self, user_id: &str, raw: &str) {
        for browser in self.browsers_of(user_id) {
            let _ = browser.tx.send(Outbound::Frame(raw.to_string()));
        }
    }

    /// `agent:offline` to every browser, then rejection of every pending
    /// request that was targeting the agent. Per browser the offline
    /// event is queued first, so it is observed before the synthesised
    /// error responses.
    fn notify_agent_offline(&self, user_id: &str, agent_id: &str) {
        let envelope = Envelope::agent_offline(agent_id);
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                error!("serialize error: {}", e);
                return;
            }
        };
        for browser in self.browsers_of(user_id) {
            let _ = browser.tx.send(Outbound::Frame(text.clone()));
            browser.pending.cancel_by_agent(agent_id);
        }
    }

    // ── In-flight request routing ──

    /// Shared handle for per-browser registries, which remove their own
    /// in-flight entries on resolution.
    pub fn inflight_handle(&self) -> Arc<DashMap<String, InflightRoute>> {
        self.inflight.clone()
    }

    pub fn insert_inflight(&self, relay_id: String, route: InflightRoute) {
        self.inflight.insert(relay_id, route);
    }

    /// Pops the route for a final `response`.
    pub fn take_inflight(&self, relay_id: &str) -> Option<InflightRoute> {
        self.inflight.remove(relay_id).map(|(_, route)| route)
    }

    /// Reads the route for a streaming partial without popping it.
    pub fn peek_inflight(&self, relay_id: &str) -> Option<InflightRoute> {
        self.inflight.get(relay_id).map(|r| r.value().clone())
    }

    pub fn remove_inflight(&self, relay_id: &str) {
        self.inflight.remove(relay_id);
    }
}
