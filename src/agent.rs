//! # Agent Sessions
//!
//! One task per agent connection. The upgrade itself is unauthenticated;
//! the first application message must be an `agent:auth` claim carrying
//! a provisioning token plus the agent's self-declared identity. After
//! that the session multiplexes the agent's output to every browser of
//! its owning user and routes correlated replies back to the single
//! browser that asked.
//!
//! ## Flow
//! 1. Accept the upgrade, arm the auth timer
//! 2. Verify the first message; `agent:auth:rejected` + close on failure,
//!    silent close on timeout
//! 3. Register in the routing tables (superseding any previous
//!    connection claiming the same agent id)
//! 4. Run the bidirectional loop
//! 5. On disconnect: unregister, which notifies browsers and rejects
//!    pending requests targeting this agent

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::protocol::{kind, AgentAuthPayload, AgentDescriptor, AgentFrame, Envelope};
use crate::state::{AgentHandle, AppState, Outbound};

// ─── Upgrade Endpoint ───────────────────────────────────────────

/// Agent upgrade handler. No HTTP-layer credentials; authentication
/// happens on the first message inside [`run_session`].
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state))
        .into_response()
}

// ─── Session ────────────────────────────────────────────────────

async fn run_session(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    // AUTH_WAIT: the first frame must arrive within the grace window.
    let first = tokio::time::timeout(state.config.agent_auth_timeout, ws_stream.next()).await;
    let claim = match first {
        Err(_) => {
            info!(error = %RelayError::AuthTimeout, "closing agent connection");
            return;
        }
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            debug!("agent connection closed before auth");
            return;
        }
    };

    let auth = match parse_auth(&claim) {
        Ok(auth) => auth,
        Err(e) => {
            warn!(error = %e, "invalid agent auth claim");
            reject(&mut ws_sink, "invalid auth message").await;
            return;
        }
    };
    let user_id = match state.collab.agent_tokens.verify(&auth.token).await {
        Ok(user_id) => user_id,
        Err(_) => {
            warn!(agent_id = %auth.agent_id, "agent token rejected");
            reject(&mut ws_sink, "invalid token").await;
            return;
        }
    };

    // LIVE: install the record. A previous connection claiming the same
    // agent id is superseded inside register_agent.
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let descriptor = AgentDescriptor {
        agent_id: auth.agent_id.clone(),
        hostname: auth.hostname,
        platform: auth.platform,
        version: auth.version,
        connected_at: Utc::now(),
    };
    let handle = AgentHandle::new(&user_id, tx, descriptor);
    let conn_id = handle.conn_id.clone();
    let agent_id = auth.agent_id;
    info!(user_id = %user_id, agent_id = %agent_id, "agent authenticated");
    state.register_agent(handle.clone());

    loop {
        tokio::select! {
            inbound = ws_stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&state, &user_id, &handle, &text);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                _ => {} // binary and transport ping/pong frames are ignored
            },
            queued = rx.recv() => match queued {
                Some(Outbound::Frame(text)) => {
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
                None => break,
            },
        }
    }

    // CLOSED: no recovery — a reconnect starts a fresh session.
    state.unregister_agent(&user_id, &agent_id, &conn_id);
}

fn parse_auth(text: &str) -> Result<AgentAuthPayload, RelayError> {
    let envelope = Envelope::parse(text)?;
    if envelope.kind != kind::AGENT_AUTH {
        return Err(RelayError::AuthRejected);
    }
    let payload = envelope.payload.ok_or(RelayError::AuthRejected)?;
    serde_json::from_value(payload).map_err(RelayError::MalformedEnvelope)
}

async fn reject(ws_sink: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let envelope = Envelope::event(kind::AGENT_AUTH_REJECTED, json!({ "error": reason }));
    if let Ok(text) = serde_json::to_string(&envelope) {
        let _ = ws_sink.send(Message::Text(text.into())).await;
    }
    let _ = ws_sink.send(Message::Close(None)).await;
}

// ─── Inbound Dispatch ───────────────────────────────────────────

fn dispatch(state: &AppState, user_id: &str, handle: &AgentHandle, text: &str) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "malformed message from agent, dropping");
            return;
        }
    };

    match AgentFrame::of(&envelope.kind) {
        AgentFrame::Response => route_reply(state, user_id, envelope, true),
        AgentFrame::Partial => route_reply(state, user_id, envelope, false),
        AgentFrame::Pong => handle.mark_alive(),
        // A second auth claim would leak the token into fan-out.
        AgentFrame::Auth => debug!("agent:auth after authentication, dropping"),
        // Everything else fans out verbatim to the owning user's
        // browsers, unknown types included.
        AgentFrame::Other => state.forward_to_user_browsers(user_id, text),
    }
}

/// Routes a correlated reply to the single browser that issued the
/// request, restoring the browser's original correlation id. Final
/// responses pop the in-flight route; partials leave it in place.
fn route_reply(state: &AppState, user_id: &str, mut envelope: Envelope, is_final: bool) {
    let Some(relay_id) = envelope.id.clone() else {
        debug!("correlated reply without id, dropping");
        return;
    };
    let route = if is_final {
        state.take_inflight(&relay_id)
    } else {
        state.peek_inflight(&relay_id)
    };
    let Some(route) = route else {
        debug!(relay_id = %relay_id, "reply with no in-flight request, dropping");
        return;
    };
    if route.user_id != user_id {
        warn!(relay_id = %relay_id, "reply crossed tenants, dropping");
        return;
    }
    let Some(browser) = state.browser_of(&route.user_id, &route.browser_id) else {
        debug!(relay_id = %relay_id, "issuing browser is gone, dropping reply");
        return;
    };

    envelope.id = Some(route.correlation_id.clone());
    if is_final {
        browser.pending.resolve(&route.correlation_id, &envelope);
    } else {
        browser.pending.deliver_partial(&route.correlation_id, &envelope);
    }
}
