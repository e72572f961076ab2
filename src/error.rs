//! # Error Taxonomy
//!
//! Every failure the relay can surface, in one place. Auth errors close
//! the connection; routing errors are synthesised back to the requesting
//! browser as `response` envelopes; transport failures are folded into
//! connection close and never propagate to other peers.

use thiserror::Error;

/// All relay-level failures.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Credentials were invalid. Surfaced as HTTP 401 on a browser
    /// upgrade, or as `agent:auth:rejected` followed by close on an
    /// agent connection.
    #[error("authentication rejected")]
    AuthRejected,

    /// The agent did not send `agent:auth` within the grace window.
    /// The socket is closed silently.
    #[error("authentication timed out")]
    AuthTimeout,

    /// A correlated request's deadline fired before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// A request targeted an agent that is not (or is no longer)
    /// connected.
    #[error("agent offline")]
    AgentOffline,

    /// A pending request was cancelled because the issuing browser
    /// disconnected. Internal only — there is nobody left to tell.
    #[error("browser disconnected")]
    BrowserDisconnected,

    /// An inbound message failed to parse. Logged and dropped; the
    /// connection stays up.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    /// A browser reused a correlation id that is still pending.
    /// Programming error in the client; logged and dropped.
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(String),
}

impl RelayError {
    /// HTTP-ish status carried in a synthesised `response` payload.
    pub fn response_status(&self) -> u16 {
        match self {
            RelayError::Timeout => 504,
            RelayError::AgentOffline => 503,
            _ => 500,
        }
    }

    /// Human-readable error string carried in a synthesised `response`
    /// payload.
    pub fn response_message(&self) -> &'static str {
        match self {
            RelayError::Timeout => "request timed out",
            RelayError::AgentOffline => "agent offline",
            _ => "internal error",
        }
    }
}
