//! # Message Envelopes
//!
//! The wire format shared by browsers and agents: JSON text frames with a
//! `"type"` discriminator, an optional correlation `"id"`, an optional
//! `"agentId"` target (browser → relay only) and an opaque `"payload"`.
//! The relay inspects only the envelope fields; payloads are forwarded
//! untouched. Unrecognised fields survive a decode/encode round trip so
//! forwarding stays lossless even for message types the relay does not
//! know about.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::RelayError;

/// Message type strings the relay produces or inspects.
pub mod kind {
    pub const AGENT_AUTH: &str = "agent:auth";
    pub const AGENT_AUTH_REJECTED: &str = "agent:auth:rejected";
    pub const AGENT_PING: &str = "agent:ping";
    pub const AGENT_PONG: &str = "agent:pong";
    pub const AGENT_ONLINE: &str = "agent:online";
    pub const AGENT_OFFLINE: &str = "agent:offline";
    pub const AGENTS_LIST: &str = "agents:list";
    pub const TIER_INFO: &str = "tier:info";
    pub const TIER_LIMIT: &str = "tier:limit";
    pub const CHAT_MESSAGE: &str = "chat:message";
    pub const RESPONSE: &str = "response";
    pub const SCAN_PARTIAL: &str = "scan:partial";
    pub const REQUEST: &str = "request";
    pub const UPDATE_INSTALL: &str = "update:install";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const TERMINAL_INPUT: &str = "terminal:input";
    pub const TERMINAL_RESIZE: &str = "terminal:resize";
    pub const TERMINAL_ATTACH: &str = "terminal:attach";
    pub const TERMINAL_CLOSE: &str = "terminal:close";
}

// ─── Envelope ───────────────────────────────────────────────────

/// The outer message structure. Everything the relay routes is one of
/// these; fields the relay does not understand are preserved in `extra`
/// so re-serialisation loses nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type discriminator, e.g. `"terminal:input"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Correlation id for request/response pairs and streaming partials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Target agent, present on browser → relay messages only.
    #[serde(rename = "agentId", default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    /// Opaque payload; never interpreted by the relay beyond the
    /// specific control payloads decoded below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Any fields this version of the relay does not know about.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Envelope {
    /// Parses one inbound text frame.
    pub fn parse(text: &str) -> Result<Envelope, RelayError> {
        Ok(serde_json::from_str(text)?)
    }

    /// An envelope with only a type and a payload.
    pub fn event(kind: &str, payload: Value) -> Envelope {
        Envelope {
            kind: kind.to_string(),
            id: None,
            agent_id: None,
            payload: Some(payload),
            extra: Map::new(),
        }
    }

    /// A bare envelope carrying nothing but its type.
    pub fn bare(kind: &str) -> Envelope {
        Envelope {
            kind: kind.to_string(),
            id: None,
            agent_id: None,
            payload: None,
            extra: Map::new(),
        }
    }

    /// A synthesised `response` envelope carrying an error status, used
    /// when the relay answers on behalf of an unreachable agent.
    pub fn error_response(correlation_id: &str, err: &RelayError) -> Envelope {
        let mut env = Envelope::event(
            kind::RESPONSE,
            json!({
                "status": err.response_status(),
                "error": err.response_message(),
            }),
        );
        env.id = Some(correlation_id.to_string());
        env
    }

    /// The `agent:offline` notification for a departed agent.
    pub fn agent_offline(agent_id: &str) -> Envelope {
        Envelope::event(kind::AGENT_OFFLINE, json!({ "agentId": agent_id }))
    }

    /// The `agent:online` notification carrying the new record's
    /// metadata.
    pub fn agent_online(descriptor: &AgentDescriptor) -> Envelope {
        Envelope::event(
            kind::AGENT_ONLINE,
            serde_json::to_value(descriptor).unwrap_or(Value::Null),
        )
    }
}

// ─── Inbound Classification ─────────────────────────────────────

/// What a browser-originated envelope means to the relay. Decoded once
/// at the envelope boundary and matched exhaustively; anything the relay
/// does not interpret lands in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserFrame {
    /// Targeted at one agent and forwarded verbatim: `terminal:input`,
    /// `terminal:resize`, `terminal:attach`, `terminal:close`,
    /// `update:install`.
    Targeted,
    /// Correlated request/response (`request`).
    Request,
    /// Client heartbeat; answered with `pong`, never forwarded.
    Ping,
    /// Unknown type; dropped and logged.
    Other,
}

impl BrowserFrame {
    pub fn of(kind: &str) -> BrowserFrame {
        match kind {
            kind::TERMINAL_INPUT
            | kind::TERMINAL_RESIZE
            | kind::TERMINAL_ATTACH
            | kind::TERMINAL_CLOSE
            | kind::UPDATE_INSTALL => BrowserFrame::Targeted,
            kind::REQUEST => BrowserFrame::Request,
            kind::PING => BrowserFrame::Ping,
            _ => BrowserFrame::Other,
        }
    }
}

/// What an agent-originated envelope means to the relay. `Other` covers
/// the whole fan-out family (`terminal:output`, `claude:states`,
/// `update:progress`, …) which is forwarded verbatim to every browser of
/// the owning user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentFrame {
    /// Final reply to a correlated request; routed to the issuing
    /// browser only.
    Response,
    /// Streaming partial; routed to the issuing browser, registry entry
    /// left in place.
    Partial,
    /// Heartbeat reply; updates the liveness timestamp, not forwarded.
    Pong,
    /// `agent:auth` after authentication already completed. Dropped —
    /// it would otherwise leak the provisioning token into fan-out.
    Auth,
    /// Everything else; fanned out to the owning user's browsers.
    Other,
}

impl AgentFrame {
    pub fn of(kind: &str) -> AgentFrame {
        match kind {
            kind::RESPONSE => AgentFrame::Response,
            kind::SCAN_PARTIAL => AgentFrame::Partial,
            kind::AGENT_PONG => AgentFrame::Pong,
            kind::AGENT_AUTH => AgentFrame::Auth,
            _ => AgentFrame::Other,
        }
    }
}

// ─── Control Payloads ───────────────────────────────────────────

/// Payload of the `agent:auth` message — the only agent message the
/// relay decodes fully.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentAuthPayload {
    /// Opaque bearer credential minted at provisioning time.
    pub token: String,

    /// Stable identifier chosen by the agent; survives reconnects.
    #[serde(rename = "agentId")]
    pub agent_id: String,

    #[serde(default)]
    pub hostname: String,

    #[serde(default)]
    pub platform: String,

    #[serde(default)]
    pub version: String,
}

/// Metadata for a connected agent, pushed to browsers in `agent:online`
/// events and the `agents:list` snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    #[serde(rename = "agentId")]
    pub agent_id: String,
    pub hostname: String,
    pub platform: String,
    pub version: String,
    #[serde(rename = "connectedAt")]
    pub connected_at: DateTime<Utc>,
}
