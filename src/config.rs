//! # Relay Configuration
//!
//! All tunables for the relay, loaded from the environment with compiled
//! defaults. Unparseable values fall back to the default with a logged
//! warning rather than aborting startup.
//!
//! | Variable | Default |
//! |---|---|
//! | `RELAY_LISTEN_ADDR` | `0.0.0.0:7070` |
//! | `RELAY_BROWSER_PATH` | `/browser` |
//! | `RELAY_AGENT_PATH` | `/agent` |
//! | `RELAY_ACCESS_COOKIE` | `access_token` |
//! | `RELAY_REFRESH_COOKIE` | `refresh_token` |
//! | `RELAY_AGENT_AUTH_TIMEOUT_SECS` | `5` |
//! | `RELAY_REQUEST_TIMEOUT_SECS` | `15` |
//! | `RELAY_HEARTBEAT_PERIOD_SECS` | `30` |
//! | `RELAY_HEARTBEAT_MAX_MISSED` | `2` |
//! | `RELAY_DEV_USER` | unset |
//! | `RELAY_BROWSER_TOKEN_SECRET` | unset |
//! | `RELAY_AGENT_TOKEN_SECRET` | unset |
//!
//! Leaving `RELAY_BROWSER_TOKEN_SECRET` unset while `RELAY_DEV_USER` is
//! set switches the browser acceptor into the development bypass: every
//! browser upgrade is attributed to the development user.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Runtime configuration for the relay process.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Socket address the upgrade port binds to.
    pub listen_addr: SocketAddr,

    /// URL path browsers upgrade on.
    pub browser_path: String,

    /// URL path agents upgrade on.
    pub agent_path: String,

    /// Cookie carrying the short-lived browser access token.
    pub access_cookie: String,

    /// Cookie carrying the long-lived browser refresh token.
    pub refresh_cookie: String,

    /// How long an agent connection may sit idle before its first
    /// message (which must be `agent:auth`).
    pub agent_auth_timeout: Duration,

    /// Deadline for correlated browser requests.
    pub request_timeout: Duration,

    /// Interval between `agent:ping` sweeps.
    pub heartbeat_period: Duration,

    /// Number of consecutive unanswered pings before an agent is
    /// declared dead and its connection closed.
    pub heartbeat_max_missed: u32,

    /// User id to synthesise when no identity provider is configured.
    pub dev_user: Option<String>,

    /// HS256 secret for browser access/refresh tokens. Unset means no
    /// identity provider — the development bypass applies if `dev_user`
    /// is set.
    pub browser_token_secret: Option<String>,

    /// HS256 secret for agent provisioning tokens.
    pub agent_token_secret: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            browser_path: "/browser".into(),
            agent_path: "/agent".into(),
            access_cookie: "access_token".into(),
            refresh_cookie: "refresh_token".into(),
            agent_auth_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            heartbeat_period: Duration::from_secs(30),
            heartbeat_max_missed: 2,
            dev_user: None,
            browser_token_secret: None,
            agent_token_secret: None,
        }
    }
}

impl RelayConfig {
    /// Loads the configuration from the environment, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: env_parsed("RELAY_LISTEN_ADDR", defaults.listen_addr),
            browser_path: env_string("RELAY_BROWSER_PATH", defaults.browser_path),
            agent_path: env_string("RELAY_AGENT_PATH", defaults.agent_path),
            access_cookie: env_string("RELAY_ACCESS_COOKIE", defaults.access_cookie),
            refresh_cookie: env_string("RELAY_REFRESH_COOKIE", defaults.refresh_cookie),
            agent_auth_timeout: env_secs("RELAY_AGENT_AUTH_TIMEOUT_SECS", defaults.agent_auth_timeout),
            request_timeout: env_secs("RELAY_REQUEST_TIMEOUT_SECS", defaults.request_timeout),
            heartbeat_period: env_secs("RELAY_HEARTBEAT_PERIOD_SECS", defaults.heartbeat_period),
            heartbeat_max_missed: env_parsed("RELAY_HEARTBEAT_MAX_MISSED", defaults.heartbeat_max_missed),
            dev_user: env_opt("RELAY_DEV_USER"),
            browser_token_secret: env_opt("RELAY_BROWSER_TOKEN_SECRET"),
            agent_token_secret: env_opt("RELAY_AGENT_TOKEN_SECRET"),
        }
    }

    /// True when no identity provider is configured and browser
    /// connections should be attributed to the development user.
    pub fn dev_bypass(&self) -> bool {
        self.browser_token_secret.is_none() && self.dev_user.is_some()
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_string(name: &str, default: String) -> String {
    env_opt(name).unwrap_or(default)
}

fn env_parsed<T: FromStr>(name: &str, default: T) -> T {
    match env_opt(name) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid {name}={raw}, using default");
            default
        }),
        None => default,
    }
}

fn env_secs(name: &str, default: Duration) -> Duration {
    match env_opt(name) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!("invalid {name}={raw}, using default");
                default
            }
        },
        None => default,
    }
}
