//! # Pending Request Registry
//!
//! One registry per browser session, keyed by the browser's own
//! correlation id. Every entry is paired with a relay-scoped id in the
//! shared in-flight table (see [`crate::state`]); the two are created
//! and torn down together, so a request can always be resolved from
//! either end: the agent's response carries the relay id, the browser's
//! registry speaks correlation ids.
//!
//! Entries leave the registry exactly once — resolved by a response,
//! rejected by a deadline, rejected because the target agent went
//! offline, or swept when the browser disconnects.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::protocol::Envelope;
use crate::state::{send_envelope, ClientTx, InflightRoute};

/// One outstanding correlated request.
struct PendingEntry {
    /// Relay-scoped id stamped on the forwarded envelope.
    relay_id: String,

    /// Agent the request was sent to; used by [`PendingRequests::cancel_by_agent`].
    target_agent_id: String,

    #[allow(dead_code)]
    created_at: Instant,

    /// Deadline task; aborted when the entry resolves early.
    timer: JoinHandle<()>,
}

/// The registry. Owned by one browser session; resolved from agent
/// sessions via the shared handle in the routing tables.
pub struct PendingRequests {
    browser_tx: ClientTx,
    inflight: Arc<DashMap<String, InflightRoute>>,
    entries: DashMap<String, PendingEntry>,
}

impl PendingRequests {
    pub fn new(
        browser_tx: ClientTx,
        inflight: Arc<DashMap<String, InflightRoute>>,
    ) -> Arc<PendingRequests> {
        Arc::new(PendingRequests {
            browser_tx,
            inflight,
            entries: DashMap::new(),
        })
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts an entry and arms its deadline timer. Rejects reuse of a
    /// correlation id that is still outstanding.
    pub fn create(
        self: &Arc<Self>,
        correlation_id: String,
        relay_id: String,
        target_agent_id: String,
        deadline: Duration,
    ) -> Result<(), RelayError> {
        if self.entries.contains_key(&correlation_id) {
            return Err(RelayError::DuplicateCorrelationId(correlation_id));
        }

        let timer = {
            let registry = Arc::clone(self);
            let correlation_id = correlation_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                registry.resolve_error(&correlation_id, &RelayError::Timeout);
            })
        };

        self.entries.insert(
            correlation_id,
            PendingEntry {
                relay_id,
                target_agent_id,
                created_at: Instant::now(),
                timer,
            },
        );
        Ok(())
    }

    /// Delivers the final response and removes the entry. A response
    /// for an id that is no longer pending is dropped.
    pub fn resolve(&self, correlation_id: &str, response: &Envelope) {
        let Some((_, entry)) = self.entries.remove(correlation_id) else {
            debug!(correlation_id, "response for unknown request, dropping");
            return;
        };
        entry.timer.abort();
        self.inflight.remove(&entry.relay_id);
        send_envelope(&self.browser_tx, response);
    }

    /// Synthesises an error response and removes the entry.
    pub fn resolve_error(&self, correlation_id: &str, error: &RelayError) {
        let Some((_, entry)) = self.entries.remove(correlation_id) else {
            return;
        };
        entry.timer.abort();
        self.inflight.remove(&entry.relay_id);
        warn!(correlation_id, error = %error, "request failed");
        send_envelope(&self.browser_tx, &Envelope::error_response(correlation_id, error));
    }

    /// Delivers a streaming partial. The entry stays; the final
    /// response still resolves it. Partials for unknown ids are dropped.
    pub fn deliver_partial(&self, correlation_id: &str, partial: &Envelope) {
        if self.entries.contains_key(correlation_id) {
            send_envelope(&self.browser_tx, partial);
        } else {
            debug!(correlation_id, "partial for unknown request, dropping");
        }
    }

    /// Rejects every entry targeting the given agent. Invoked when the
    /// agent goes offline, after the `agent:offline` event has been
    /// queued, so the browser observes them in that order.
    pub fn cancel_by_agent(&self, agent_id: &str) {
        let matching: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.target_agent_id == agent_id)
            .map(|e| e.key().clone())
            .collect();
        for correlation_id in matching {
            self.resolve_error(&correlation_id, &RelayError::AgentOffline);
        }
    }

    /// Sweeps the registry on browser disconnect. Nothing is sent —
    /// there is nobody to send to — but timers are disarmed and the
    /// in-flight routes dropped so late agent responses fall on the
    /// floor instead of leaking.
    pub fn cancel_all(&self) {
        let all: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for correlation_id in all {
            if let Some((_, entry)) = self.entries.remove(&correlation_id) {
                entry.timer.abort();
                self.inflight.remove(&entry.relay_id);
            }
        }
        debug!(error = %RelayError::BrowserDisconnected, "pending requests swept");
    }
}
