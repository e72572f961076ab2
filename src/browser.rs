//! # Browser Sessions
//!
//! One task per browser connection:
//! - Authenticates the upgrade from cookie tokens before accepting it
//! - Greets the new session with `tier:info` and an `agents:list` snapshot
//! - Dispatches inbound messages by type (targeted forward, correlated
//!   request, heartbeat)
//! - Owns the pending-request registry and sweeps it on close
//!
//! ## Flow
//! 1. Verify the session tokens; 401 without upgrading on failure
//! 2. Register in the routing tables; subscribe to chat fan-in
//! 3. Run the bidirectional loop (inbound frames, queued outbound)
//! 4. On disconnect: unsubscribe, cancel pending requests, unregister

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::authenticate_browser;
use crate::collab::ChatBroadcaster;
use crate::error::RelayError;
use crate::pending::PendingRequests;
use crate::protocol::{kind, BrowserFrame, Envelope};
use crate::state::{send_envelope, AppState, BrowserHandle, ClientTx, InflightRoute, Outbound};

// ─── Upgrade Endpoint ───────────────────────────────────────────

/// Browser upgrade handler. Authentication happens before the upgrade:
/// a browser with bad tokens gets a plain 401 and no WebSocket.
pub async fn ws_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    ws: WebSocketUpgrade,
) -> Response {
    let access = jar
        .get(&state.config.access_cookie)
        .map(|c| c.value().to_string());
    let refresh = jar
        .get(&state.config.refresh_cookie)
        .map(|c| c.value().to_string());

    match authenticate_browser(
        &state.config,
        &state.collab,
        access.as_deref(),
        refresh.as_deref(),
    )
    .await
    {
        Ok(user_id) => ws.on_upgrade(move |socket| run_session(socket, state, user_id)),
        Err(err) => {
            warn!(error = %err, "browser upgrade rejected");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

// ─── Session ────────────────────────────────────────────────────

async fn run_session(socket: WebSocket, state: AppState, user_id: String) {
    let browser_id = Uuid::new_v4().to_string();
    info!(user_id = %user_id, browser_id = %browser_id, "browser connected");

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let pending = PendingRequests::new(tx.clone(), state.inflight_handle());

    state.register_browser(
        &user_id,
        &browser_id,
        BrowserHandle {
            tx: tx.clone(),
            pending: pending.clone(),
        },
    );

    // Greeting: per-user policy data, then the current agent set.
    let tier = state.collab.policy.tier_info_for(&user_id).await;
    send_envelope(&tx, &Envelope::event(kind::TIER_INFO, tier));
    let agents = state.agents_snapshot(&user_id);
    send_envelope(
        &tx,
        &Envelope::event(kind::AGENTS_LIST, json!({ "agents": agents })),
    );

    // Chat fan-in. The delivery closure captures only the write queue,
    // so dropping the session drops the subscription's reach.
    let chat_subscription = {
        let tx = tx.clone();
        state.collab.chat.subscribe(
            &user_id,
            Arc::new(move |envelope| send_envelope(&tx, &envelope)),
        )
    };

    loop {
        tokio::select! {
            inbound = ws_stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&state, &user_id, &browser_id, &tx, &pending, &text);
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

    info!(user_id = %user_id, browser_id = %browser_id, "browser disconnected");
    state.collab.chat.unsubscribe(&user_id, chat_subscription);
    pending.cancel_all();
    state.unregister_browser(&user_id, &browser_id);
}

// ─── Inbound Dispatch ───────────────────────────────────────────

fn dispatch(
    state: &AppState,
    user_id: &str,
    browser_id: &str,
    tx: &ClientTx,
    pending: &Arc<PendingRequests>,
    text: &str,
) {
    let envelope = match Envelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "malformed message from browser, dropping");
            return;
        }
    };

    match BrowserFrame::of(&envelope.kind) {
        // terminal:* and update:install go to one agent, untouched.
        // An offline target means a silent drop.
        BrowserFrame::Targeted => {
            let Some(agent_id) = envelope.agent_id.as_deref() else {
                warn!(kind = %envelope.kind, "targeted message without agentId, dropping");
                return;
            };
            match state.agent_of(user_id, agent_id) {
                Some(agent) => {
                    let _ = agent.tx.send(Outbound::Frame(text.to_string()));
                }
                None => {
                    debug!(agent_id = %agent_id, "targeted message for offline agent, dropping");
                }
            }
        }

        BrowserFrame::Request => handle_request(state, user_id, browser_id, tx, pending, envelope),

        BrowserFrame::Ping => send_envelope(tx, &Envelope::bare(kind::PONG)),

        BrowserFrame::Other => {
            warn!(kind = %envelope.kind, "unknown message type from browser, dropping");
        }
    }
}

/// Correlated request path. The browser's correlation id is only unique
/// within that browser, so the forwarded envelope is re-stamped with a
/// relay-scoped id; the in-flight table maps it back for the response.
fn handle_request(
    state: &AppState,
    user_id: &str,
    browser_id: &str,
    tx: &ClientTx,
    pending: &Arc<PendingRequests>,
    envelope: Envelope,
) {
    let Some(correlation_id) = envelope.id.clone() else {
        warn!("request without correlation id, dropping");
        return;
    };
    let Some(agent_id) = envelope.agent_id.clone() else {
        send_envelope(
            tx,
            &Envelope::error_response(&correlation_id, &RelayError::AgentOffline),
        );
        return;
    };

    let Some(agent) = state.agent_of(user_id, &agent_id) else {
        send_envelope(
            tx,
            &Envelope::error_response(&correlation_id, &RelayError::AgentOffline),
        );
        return;
    };

    let relay_id = Uuid::new_v4().to_string();
    state.insert_inflight(
        relay_id.clone(),
        InflightRoute {
            user_id: user_id.to_string(),
            browser_id: browser_id.to_string(),
            agent_id: agent_id.clone(),
            correlation_id: correlation_id.clone(),
        },
    );
    if let Err(err) = pending.create(
        correlation_id.clone(),
        relay_id.clone(),
        agent_id,
        state.config.request_timeout,
    ) {
        warn!(error = %err, "dropping request");
        state.remove_inflight(&relay_id);
        return;
    }

    // Forward under the relay-scoped id; the target field is relay-only
    // and is stripped before delivery.
    let mut forwarded = envelope;
    forwarded.id = Some(relay_id);
    forwarded.agent_id = None;
    match serde_json::to_string(&forwarded) {
        Ok(text) => {
            if agent.tx.send(Outbound::Frame(text)).is_err() {
                // The agent's write loop is already gone.
                pending.resolve_error(&correlation_id, &RelayError::AgentOffline);
            }
        }
        Err(e) => {
            error!("serialize error: {}", e);
            pending.resolve_error(&correlation_id, &RelayError::MalformedEnvelope(e));
        }
    }
}
