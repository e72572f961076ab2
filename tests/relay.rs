//! End-to-end relay scenarios over real WebSocket connections: a server
//! bound to an ephemeral port, browsers authenticated via cookie tokens,
//! agents via first-message auth claims.

use futures::{SinkExt, StreamExt};
use relay_server::auth::{mint_token, REFRESH_TOKEN_TYPE};
use relay_server::collab::Collaborators;
use relay_server::config::RelayConfig;
use relay_server::state::AppState;
use relay_server::{heartbeat, router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const BROWSER_SECRET: &str = "browser-secret";
const AGENT_SECRET: &str = "agent-secret";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Harness ────────────────────────────────────────────────────

fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.request_timeout = Duration::from_millis(400);
    config.agent_auth_timeout = Duration::from_millis(300);
    config.browser_token_secret = Some(BROWSER_SECRET.into());
    config.agent_token_secret = Some(AGENT_SECRET.into());
    config
}

async fn spawn_relay(config: RelayConfig) -> SocketAddr {
    let collab = Collaborators::from_config(&config);
    let state = AppState::new(config, collab);
    heartbeat::spawn(state.clone());
    let app = router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn browser_request(addr: SocketAddr, cookies: &str) -> tokio_tungstenite::tungstenite::handshake::client::Request {
    let mut request = format!("ws://{addr}/browser").into_client_request().unwrap();
    request
        .headers_mut()
        .insert(COOKIE, HeaderValue::from_str(cookies).unwrap());
    request
}

/// Connects a browser with a fresh access token and drains the
/// `tier:info` / `agents:list` greeting.
async fn connect_browser(addr: SocketAddr, user: &str) -> Socket {
    let access = mint_token(BROWSER_SECRET, user, 3600, None).unwrap();
    let request = browser_request(addr, &format!("access_token={access}"));
    let (mut socket, _) = connect_async(request).await.unwrap();

    let greeting = recv_msg(&mut socket).await;
    assert_eq!(greeting["type"], "tier:info");
    let listing = recv_msg(&mut socket).await;
    assert_eq!(listing["type"], "agents:list");
    socket
}

/// Connects an agent and sends its auth claim. Registration is silent
/// on the agent side; tests synchronise on the browser's `agent:online`.
async fn connect_agent(addr: SocketAddr, user: &str, agent_id: &str) -> Socket {
    let token = mint_token(AGENT_SECRET, user, 3600, None).unwrap();
    let (mut socket, _) = connect_async(format!("ws://{addr}/agent")).await.unwrap();
    let claim = json!({
        "type": "agent:auth",
        "payload": {
            "token": token,
            "agentId": agent_id,
            "hostname": "testhost",
            "platform": "linux",
            "version": "0.0.1"
        }
    });
    socket.send(Message::text(claim.to_string())).await.unwrap();
    socket
}

async fn send_json(socket: &mut Socket, value: Value) {
    socket.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping transport-level frames.
async fn recv_msg(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("transport error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Next text frame of the given type, skipping others (including
/// heartbeat pings on agent sockets).
async fn recv_kind(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let value = recv_msg(socket).await;
        if value["type"] == kind {
            return value;
        }
    }
}

/// Asserts the peer closes the connection within the window.
async fn assert_closed(socket: &mut Socket, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, socket.next()).await {
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("connection stayed open"),
        }
    }
}

/// Asserts no application frame (other than heartbeat pings) arrives
/// within the window.
async fn assert_silent(socket: &mut Socket, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, socket.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(value["type"], "agent:ping", "unexpected frame: {text}");
            }
            Ok(_) => continue,
        }
    }
}

// ─── Scenarios ──────────────────────────────────────────────────

#[tokio::test]
async fn browser_greeting_carries_tier_and_agent_list() {
    let addr = spawn_relay(test_config()).await;
    let access = mint_token(BROWSER_SECRET, "u1", 3600, None).unwrap();
    let request = browser_request(addr, &format!("access_token={access}"));
    let (mut socket, _) = connect_async(request).await.unwrap();

    let greeting = recv_msg(&mut socket).await;
    assert_eq!(greeting["type"], "tier:info");
    assert!(greeting["payload"].is_object());

    let listing = recv_msg(&mut socket).await;
    assert_eq!(listing["type"], "agents:list");
    assert_eq!(listing["payload"]["agents"], json!([]));
}

#[tokio::test]
async fn request_response_happy_path() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;
    let mut agent = connect_agent(addr, "u1", "agent-1").await;

    let online = recv_kind(&mut browser, "agent:online").await;
    assert_eq!(online["payload"]["agentId"], "agent-1");
    assert_eq!(online["payload"]["hostname"], "testhost");

    send_json(
        &mut browser,
        json!({
            "type": "request",
            "id": "r-1",
            "agentId": "agent-1",
            "payload": { "method": "GET", "path": "/api/x" }
        }),
    )
    .await;

    // The agent sees the request under a relay-scoped id with the
    // routing target stripped; the payload is untouched.
    let forwarded = recv_kind(&mut agent, "request").await;
    assert_eq!(forwarded["payload"], json!({ "method": "GET", "path": "/api/x" }));
    assert!(forwarded["agentId"].is_null());
    let relay_id = forwarded["id"].as_str().unwrap().to_string();
    assert_ne!(relay_id, "r-1");

    send_json(
        &mut agent,
        json!({
            "type": "response",
            "id": relay_id,
            "payload": { "status": 200, "body": { "ok": true } }
        }),
    )
    .await;

    // The browser gets exactly one response, under its own id.
    let response = recv_msg(&mut browser).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["id"], "r-1");
    assert_eq!(response["payload"]["status"], 200);
    assert_eq!(response["payload"]["body"]["ok"], true);
}

#[tokio::test]
async fn request_to_offline_agent_is_answered_locally() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;

    send_json(
        &mut browser,
        json!({ "type": "request", "id": "r-1", "agentId": "nope", "payload": {} }),
    )
    .await;

    let response = recv_msg(&mut browser).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["id"], "r-1");
    assert_eq!(response["payload"]["status"], 503);
    assert_eq!(response["payload"]["error"], "agent offline");
}

#[tokio::test]
async fn agent_disconnect_rejects_pending_requests_after_offline_event() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;
    let mut agent = connect_agent(addr, "u1", "agent-1").await;
    recv_kind(&mut browser, "agent:online").await;

    send_json(
        &mut browser,
        json!({ "type": "request", "id": "r-2", "agentId": "agent-1", "payload": {} }),
    )
    .await;
    // Make sure the request is actually in flight before killing the
    // agent.
    recv_kind(&mut agent, "request").await;
    agent.close(None).await.unwrap();

    // Strict order: offline first, then the synthesised response.
    let offline = recv_msg(&mut browser).await;
    assert_eq!(offline["type"], "agent:offline");
    assert_eq!(offline["payload"]["agentId"], "agent-1");

    let response = recv_msg(&mut browser).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["id"], "r-2");
    assert_eq!(response["payload"]["status"], 503);
    assert_eq!(response["payload"]["error"], "agent offline");
}

#[tokio::test]
async fn reconnect_supersedes_previous_agent_connection() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;
    let mut first = connect_agent(addr, "u1", "agent-1").await;
    recv_kind(&mut browser, "agent:online").await;

    // Leave a request pending on the first connection.
    send_json(
        &mut browser,
        json!({ "type": "request", "id": "r-3", "agentId": "agent-1", "payload": {} }),
    )
    .await;
    recv_kind(&mut first, "request").await;

    let _second = connect_agent(addr, "u1", "agent-1").await;

    // The displaced record goes offline, its pending request is
    // rejected, then the replacement comes online.
    let offline = recv_msg(&mut browser).await;
    assert_eq!(offline["type"], "agent:offline");
    let response = recv_msg(&mut browser).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["id"], "r-3");
    assert_eq!(response["payload"]["status"], 503);
    let online = recv_msg(&mut browser).await;
    assert_eq!(online["type"], "agent:online");
    assert_eq!(online["payload"]["agentId"], "agent-1");

    // The old connection is closed by the relay.
    assert_closed(&mut first, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn streaming_partials_precede_the_final_response() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;
    let mut agent = connect_agent(addr, "u1", "agent-1").await;
    recv_kind(&mut browser, "agent:online").await;

    send_json(
        &mut browser,
        json!({ "type": "request", "id": "r-4", "agentId": "agent-1", "payload": { "method": "GET", "path": "/scan" } }),
    )
    .await;
    let forwarded = recv_kind(&mut agent, "request").await;
    let relay_id = forwarded["id"].as_str().unwrap().to_string();

    for chunk in 1..=3 {
        send_json(
            &mut agent,
            json!({ "type": "scan:partial", "id": relay_id, "payload": { "chunk": chunk } }),
        )
        .await;
    }
    send_json(
        &mut agent,
        json!({ "type": "response", "id": relay_id, "payload": { "status": 200 } }),
    )
    .await;

    for chunk in 1..=3 {
        let partial = recv_msg(&mut browser).await;
        assert_eq!(partial["type"], "scan:partial");
        assert_eq!(partial["id"], "r-4");
        assert_eq!(partial["payload"]["chunk"], chunk);
    }
    let response = recv_msg(&mut browser).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["id"], "r-4");

    // The registry entry is gone: a late partial is dropped, not
    // delivered.
    send_json(
        &mut agent,
        json!({ "type": "scan:partial", "id": relay_id, "payload": { "chunk": 4 } }),
    )
    .await;
    assert_silent(&mut browser, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;
    let mut agent = connect_agent(addr, "u1", "agent-1").await;
    recv_kind(&mut browser, "agent:online").await;

    send_json(
        &mut browser,
        json!({ "type": "request", "id": "r-5", "agentId": "agent-1", "payload": {} }),
    )
    .await;
    recv_kind(&mut agent, "request").await;
    // The agent never answers.

    let response = recv_msg(&mut browser).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["id"], "r-5");
    assert_eq!(response["payload"]["status"], 504);
    assert_eq!(response["payload"]["error"], "request timed out");
}

#[tokio::test]
async fn cross_tenant_messages_never_arrive() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;
    let mut foreign_agent = connect_agent(addr, "u2", "agent-1").await;

    // Targeted message: silent drop on the browser side, nothing on the
    // foreign agent.
    send_json(
        &mut browser,
        json!({ "type": "terminal:input", "agentId": "agent-1", "payload": { "data": "whoami" } }),
    )
    .await;

    // Correlated request: answered locally as agent-not-found.
    send_json(
        &mut browser,
        json!({ "type": "request", "id": "r-6", "agentId": "agent-1", "payload": {} }),
    )
    .await;
    let response = recv_msg(&mut browser).await;
    assert_eq!(response["type"], "response");
    assert_eq!(response["payload"]["status"], 503);

    assert_silent(&mut foreign_agent, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn agent_fan_out_reaches_every_browser_of_the_user() {
    let addr = spawn_relay(test_config()).await;
    let mut b1 = connect_browser(addr, "u1").await;
    let mut b2 = connect_browser(addr, "u1").await;
    let mut other_tenant = connect_browser(addr, "u2").await;
    let mut agent = connect_agent(addr, "u1", "agent-1").await;
    recv_kind(&mut b1, "agent:online").await;
    recv_kind(&mut b2, "agent:online").await;

    // Unknown-to-the-relay message type with extra fields: forwarded
    // verbatim to both browsers of the owning user.
    send_json(
        &mut agent,
        json!({ "type": "terminal:output", "payload": { "data": "aGVsbG8=" }, "seq": 7 }),
    )
    .await;

    for browser in [&mut b1, &mut b2] {
        let output = recv_msg(browser).await;
        assert_eq!(output["type"], "terminal:output");
        assert_eq!(output["payload"]["data"], "aGVsbG8=");
        assert_eq!(output["seq"], 7);
    }
    assert_silent(&mut other_tenant, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn browser_ping_gets_pong_and_is_not_forwarded() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;
    let mut agent = connect_agent(addr, "u1", "agent-1").await;
    recv_kind(&mut browser, "agent:online").await;

    send_json(&mut browser, json!({ "type": "ping" })).await;
    let pong = recv_msg(&mut browser).await;
    assert_eq!(pong["type"], "pong");
    assert_silent(&mut agent, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn unknown_browser_message_is_dropped_without_disconnect() {
    let addr = spawn_relay(test_config()).await;
    let mut browser = connect_browser(addr, "u1").await;

    send_json(&mut browser, json!({ "type": "no:such:type" })).await;
    browser.send(Message::text("not json at all")).await.unwrap();

    // Still connected and responsive.
    send_json(&mut browser, json!({ "type": "ping" })).await;
    let pong = recv_msg(&mut browser).await;
    assert_eq!(pong["type"], "pong");
}

// ─── Authentication ─────────────────────────────────────────────

#[tokio::test]
async fn expired_access_token_with_valid_refresh_authenticates() {
    let addr = spawn_relay(test_config()).await;
    let access = mint_token(BROWSER_SECRET, "u1", -3600, None).unwrap();
    let refresh = mint_token(BROWSER_SECRET, "u1", 3600, Some(REFRESH_TOKEN_TYPE)).unwrap();
    let request = browser_request(addr, &format!("access_token={access}; refresh_token={refresh}"));

    let (mut socket, _) = connect_async(request).await.unwrap();
    let greeting = recv_msg(&mut socket).await;
    assert_eq!(greeting["type"], "tier:info");
}

#[tokio::test]
async fn expired_access_and_expired_refresh_is_unauthorized() {
    let addr = spawn_relay(test_config()).await;
    let access = mint_token(BROWSER_SECRET, "u1", -3600, None).unwrap();
    let refresh = mint_token(BROWSER_SECRET, "u1", -3600, Some(REFRESH_TOKEN_TYPE)).unwrap();
    let request = browser_request(addr, &format!("access_token={access}; refresh_token={refresh}"));

    assert!(connect_async(request).await.is_err());
}

#[tokio::test]
async fn browser_without_tokens_is_unauthorized() {
    let addr = spawn_relay(test_config()).await;
    assert!(connect_async(format!("ws://{addr}/browser")).await.is_err());
}

#[tokio::test]
async fn dev_bypass_admits_browsers_without_tokens() {
    let mut config = test_config();
    config.browser_token_secret = None;
    config.dev_user = Some("dev".into());
    let addr = spawn_relay(config).await;

    let (mut socket, _) = connect_async(format!("ws://{addr}/browser")).await.unwrap();
    let greeting = recv_msg(&mut socket).await;
    assert_eq!(greeting["type"], "tier:info");
}

#[tokio::test]
async fn agent_with_bad_token_is_rejected() {
    let addr = spawn_relay(test_config()).await;
    let (mut socket, _) = connect_async(format!("ws://{addr}/agent")).await.unwrap();
    send_json(
        &mut socket,
        json!({
            "type": "agent:auth",
            "payload": { "token": "garbage", "agentId": "agent-1" }
        }),
    )
    .await;

    let rejection = recv_msg(&mut socket).await;
    assert_eq!(rejection["type"], "agent:auth:rejected");
    assert_closed(&mut socket, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn silent_agent_is_closed_after_auth_timeout() {
    let addr = spawn_relay(test_config()).await;
    let (mut socket, _) = connect_async(format!("ws://{addr}/agent")).await.unwrap();
    // Send nothing; the relay closes without a rejection message.
    assert_closed(&mut socket, Duration::from_secs(2)).await;
}

#[tokio::test]
async fn unknown_upgrade_paths_are_refused() {
    let addr = spawn_relay(test_config()).await;
    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
    assert!(connect_async(format!("ws://{addr}/")).await.is_err());
}

// ─── Heartbeat ──────────────────────────────────────────────────

#[tokio::test]
async fn unresponsive_agent_is_evicted_by_heartbeat() {
    let mut config = test_config();
    config.heartbeat_period = Duration::from_millis(100);
    config.heartbeat_max_missed = 2;
    let addr = spawn_relay(config).await;

    let mut browser = connect_browser(addr, "u1").await;
    let mut agent = connect_agent(addr, "u1", "agent-1").await;
    recv_kind(&mut browser, "agent:online").await;

    // The agent never answers agent:ping.
    recv_kind(&mut agent, "agent:ping").await;
    assert_closed(&mut agent, Duration::from_secs(2)).await;

    let offline = recv_kind(&mut browser, "agent:offline").await;
    assert_eq!(offline["payload"]["agentId"], "agent-1");
}

#[tokio::test]
async fn responsive_agent_survives_heartbeat_sweeps() {
    let mut config = test_config();
    config.heartbeat_period = Duration::from_millis(100);
    config.heartbeat_max_missed = 2;
    let addr = spawn_relay(config).await;

    let mut browser = connect_browser(addr, "u1").await;
    let mut agent = connect_agent(addr, "u1", "agent-1").await;
    recv_kind(&mut browser, "agent:online").await;

    // Answer pings for well past the eviction horizon.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(700);
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, agent.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "agent:ping" {
                    send_json(&mut agent, json!({ "type": "agent:pong" })).await;
                }
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {
                panic!("live agent was evicted")
            }
            _ => break,
        }
    }
    assert_silent(&mut browser, Duration::from_millis(100)).await;
}
