//! # External Collaborators
//!
//! The relay consumes a handful of thin contracts from the rest of the
//! platform: token verification, user lookup, per-user policy data and
//! the chat fan-in. They are bundled in [`Collaborators`] and injected
//! into the shared state so nothing reaches for ambient globals.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::auth::{
    AgentTokenVerifier, DevAgentTokens, JwtAgentTokens, JwtVerifier, RejectAllAgentTokens,
    StaticUserLookup, TokenVerifier, UserLookup,
};
use crate::config::RelayConfig;
use crate::protocol::{kind, Envelope};

// ─── Policy ─────────────────────────────────────────────────────

/// Supplies the opaque per-user policy payload pushed to each browser
/// on connect (`tier:info`).
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    async fn tier_info_for(&self, user_id: &str) -> Value;
}

/// Policy provider returning the same payload for every user.
pub struct FixedTier {
    payload: Value,
}

impl FixedTier {
    pub fn new(payload: Value) -> Self {
        Self { payload }
    }
}

impl Default for FixedTier {
    fn default() -> Self {
        Self {
            payload: json!({ "tier": "free" }),
        }
    }
}

#[async_trait]
impl PolicyProvider for FixedTier {
    async fn tier_info_for(&self, _user_id: &str) -> Value {
        self.payload.clone()
    }
}

// ─── Chat ───────────────────────────────────────────────────────

/// Callback invoked with a ready-to-send envelope for one subscriber.
/// Captures only a channel sender, never session internals, so dropping
/// a session drops its subscription without graph traversal.
pub type ChatDelivery = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Lets external code push `chat:message` envelopes to every browser a
/// user has open. Browser sessions subscribe on start and unsubscribe
/// on close.
pub trait ChatBroadcaster: Send + Sync {
    fn subscribe(&self, user_id: &str, deliver: ChatDelivery) -> u64;
    fn unsubscribe(&self, user_id: &str, subscription_id: u64);
}

/// Process-local chat broadcaster for co-resident subsystems.
#[derive(Default)]
pub struct InMemoryChatBroadcaster {
    subscribers: DashMap<String, Vec<(u64, ChatDelivery)>>,
    next_id: AtomicU64,
}

impl InMemoryChatBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivers a chat payload to every subscriber of the user.
    pub fn broadcast(&self, user_id: &str, payload: Value) {
        let deliveries: Vec<ChatDelivery> = match self.subscribers.get(user_id) {
            Some(subs) => subs.iter().map(|(_, d)| d.clone()).collect(),
            None => return,
        };
        let envelope = Envelope::event(kind::CHAT_MESSAGE, payload);
        for deliver in deliveries {
            deliver(envelope.clone());
        }
    }
}

impl ChatBroadcaster for InMemoryChatBroadcaster {
    fn subscribe(&self, user_id: &str, deliver: ChatDelivery) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(user_id.to_string())
            .or_default()
            .push((id, deliver));
        id
    }

    fn unsubscribe(&self, user_id: &str, subscription_id: u64) {
        if let Some(mut subs) = self.subscribers.get_mut(user_id) {
            subs.retain(|(id, _)| *id != subscription_id);
            let empty = subs.is_empty();
            drop(subs);
            if empty {
                self.subscribers.remove_if(user_id, |_, s| s.is_empty());
            }
        }
    }
}

// ─── Bundle ─────────────────────────────────────────────────────

/// Everything the relay consumes from the rest of the platform.
#[derive(Clone)]
pub struct Collaborators {
    /// Browser session-token verifier. `None` means no identity
    /// provider is configured (development bypass territory).
    pub browser_tokens: Option<Arc<dyn TokenVerifier>>,
    pub users: Arc<dyn UserLookup>,
    pub agent_tokens: Arc<dyn AgentTokenVerifier>,
    pub policy: Arc<dyn PolicyProvider>,
    pub chat: Arc<InMemoryChatBroadcaster>,
}

impl Collaborators {
    /// Wires the default collaborator set from the configuration:
    /// JWT-backed verifiers when secrets are present, development
    /// fallbacks otherwise.
    pub fn from_config(config: &RelayConfig) -> Self {
        let browser_tokens: Option<Arc<dyn TokenVerifier>> = config
            .browser_token_secret
            .as_deref()
            .map(|secret| Arc::new(JwtVerifier::new(secret)) as Arc<dyn TokenVerifier>);

        let agent_tokens: Arc<dyn AgentTokenVerifier> =
            match (&config.agent_token_secret, &config.dev_user) {
                (Some(secret), _) => Arc::new(JwtAgentTokens::new(secret)),
                (None, Some(user)) => Arc::new(DevAgentTokens {
                    user_id: user.clone(),
                }),
                (None, None) => Arc::new(RejectAllAgentTokens),
            };

        Self {
            browser_tokens,
            users: Arc::new(StaticUserLookup::any()),
            agent_tokens,
            policy: Arc::new(FixedTier::default()),
            chat: Arc::new(InMemoryChatBroadcaster::new()),
        }
    }

    /// Bare-bones set for unit tests: no identity provider, reject-all
    /// agent tokens.
    pub fn for_tests() -> Self {
        Self {
            browser_tokens: None,
            users: Arc::new(StaticUserLookup::any()),
            agent_tokens: Arc::new(RejectAllAgentTokens),
            policy: Arc::new(FixedTier::default()),
            chat: Arc::new(InMemoryChatBroadcaster::new()),
        }
    }
}
