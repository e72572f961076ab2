//! # Authentication
//!
//! Two schemes, one per connection class:
//!
//! - **Browsers** present signed session tokens in request cookies,
//!   checked before the upgrade completes. An expired access token falls
//!   through to the refresh token; any other failure terminates the
//!   attempt.
//! - **Agents** upgrade unauthenticated and must present a provisioning
//!   token in their first message (`agent:auth`).
//!
//! The verification seams are traits so deployments can plug in their
//! identity provider; this crate ships HS256 JWT implementations plus
//! the in-memory ones used by the development bypass and the test suite.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::collab::Collaborators;
use crate::config::RelayConfig;
use crate::error::RelayError;

/// Claim that must be present on refresh tokens.
pub const REFRESH_TOKEN_TYPE: &str = "refresh";

// ─── Contracts ──────────────────────────────────────────────────

/// Why a token failed verification. `Expired` is distinguished because
/// the browser acceptor falls through to the refresh token only in that
/// case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    Expired,
    Invalid,
}

/// A successfully verified browser token.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// Subject claim — the user id the token was issued to.
    pub subject: String,
    /// Optional type claim; refresh tokens carry `"refresh"`.
    pub token_type: Option<String>,
}

/// Verifies browser session tokens (access and refresh).
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<VerifiedToken, TokenError>;
}

/// Verifies agent provisioning tokens, resolving the owning user.
#[async_trait]
pub trait AgentTokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, TokenError>;
}

/// Confirms a token subject names an existing user.
#[async_trait]
pub trait UserLookup: Send + Sync {
    async fn get(&self, user_id: &str) -> Option<UserRecord>;
}

/// The slice of a user record the relay cares about.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
}

// ─── JWT Implementations ────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token_type: Option<String>,
}

/// HS256 verifier for browser session tokens.
pub struct JwtVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<VerifiedToken, TokenError> {
        let claims = self.decode(token)?;
        Ok(VerifiedToken {
            subject: claims.sub,
            token_type: claims.token_type,
        })
    }
}

/// HS256 verifier for agent provisioning tokens. The subject claim is
/// the owning user id.
pub struct JwtAgentTokens {
    inner: JwtVerifier,
}

impl JwtAgentTokens {
    pub fn new(secret: &str) -> Self {
        Self {
            inner: JwtVerifier::new(secret),
        }
    }
}

#[async_trait]
impl AgentTokenVerifier for JwtAgentTokens {
    async fn verify(&self, token: &str) -> Result<String, TokenError> {
        Ok(self.inner.decode(token)?.sub)
    }
}

/// Development-mode verifier: accepts every provisioning token and maps
/// it to the configured development user.
pub struct DevAgentTokens {
    pub user_id: String,
}

#[async_trait]
impl AgentTokenVerifier for DevAgentTokens {
    async fn verify(&self, _token: &str) -> Result<String, TokenError> {
        Ok(self.user_id.clone())
    }
}

/// Verifier used when no agent secret and no development user are
/// configured: nothing can authenticate.
pub struct RejectAllAgentTokens;

#[async_trait]
impl AgentTokenVerifier for RejectAllAgentTokens {
    async fn verify(&self, _token: &str) -> Result<String, TokenError> {
        Err(TokenError::Invalid)
    }
}

/// User directory backed by a fixed set of ids, or accepting any
/// verified subject when built with [`StaticUserLookup::any`]. Real
/// deployments substitute their account store at this seam.
pub struct StaticUserLookup {
    users: Option<HashSet<String>>,
}

impl StaticUserLookup {
    /// Accept every subject a token verifier vouches for.
    pub fn any() -> Self {
        Self { users: None }
    }

    /// Accept exactly the given user ids.
    pub fn of<I: IntoIterator<Item = S>, S: Into<String>>(ids: I) -> Self {
        Self {
            users: Some(ids.into_iter().map(Into::into).collect()),
        }
    }
}

#[async_trait]
impl UserLookup for StaticUserLookup {
    async fn get(&self, user_id: &str) -> Option<UserRecord> {
        match &self.users {
            Some(users) if !users.contains(user_id) => None,
            _ => Some(UserRecord {
                user_id: user_id.to_string(),
            }),
        }
    }
}

/// Mints an HS256 token. Used by the platform when provisioning agents
/// and issuing browser sessions, and by the test suite.
pub fn mint_token(
    secret: &str,
    subject: &str,
    ttl_secs: i64,
    token_type: Option<&str>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        sub: subject.to_string(),
        exp: Utc::now().timestamp() + ttl_secs,
        token_type: token_type.map(str::to_string),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

// ─── Browser Authentication ─────────────────────────────────────

/// Resolves a browser upgrade to a user id from its cookie tokens.
///
/// 1. A verifying access token wins, provided its subject exists.
/// 2. An *expired* (or absent) access token falls through to the
///    refresh token, which must carry the `"refresh"` type claim.
/// 3. Any other access-token failure terminates the attempt.
/// 4. Without an identity provider, the development user is synthesised.
pub async fn authenticate_browser(
    config: &RelayConfig,
    collab: &Collaborators,
    access: Option<&str>,
    refresh: Option<&str>,
) -> Result<String, RelayError> {
    let Some(verifier) = &collab.browser_tokens else {
        // No identity provider configured — development bypass.
        if let Some(dev_user) = &config.dev_user {
            return Ok(dev_user.clone());
        }
        return Err(RelayError::AuthRejected);
    };

    if let Some(token) = access {
        match verifier.verify(token) {
            Ok(verified) => return lookup_user(collab, &verified.subject).await,
            Err(TokenError::Expired) => {} // fall through to refresh
            Err(TokenError::Invalid) => return Err(RelayError::AuthRejected),
        }
    }

    let Some(token) = refresh else {
        return Err(RelayError::AuthRejected);
    };
    match verifier.verify(token) {
        Ok(verified) if verified.token_type.as_deref() == Some(REFRESH_TOKEN_TYPE) => {
            lookup_user(collab, &verified.subject).await
        }
        _ => Err(RelayError::AuthRejected),
    }
}

async fn lookup_user(collab: &Collaborators, subject: &str) -> Result<String, RelayError> {
    match collab.users.get(subject).await {
        Some(record) => Ok(record.user_id),
        None => Err(RelayError::AuthRejected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Collaborators;
    use std::sync::Arc;

    const SECRET: &str = "test-secret";

    fn collaborators(users: StaticUserLookup) -> Collaborators {
        let mut collab = Collaborators::for_tests();
        collab.browser_tokens = Some(Arc::new(JwtVerifier::new(SECRET)));
        collab.users = Arc::new(users);
        collab
    }

    #[test]
    fn expired_is_distinguished_from_invalid() {
        let verifier = JwtVerifier::new(SECRET);
        let expired = mint_token(SECRET, "u1", -3600, None).unwrap();
        assert_eq!(verifier.verify(&expired).unwrap_err(), TokenError::Expired);
        let forged = mint_token("other-secret", "u1", 3600, None).unwrap();
        assert_eq!(verifier.verify(&forged).unwrap_err(), TokenError::Invalid);
    }

    #[tokio::test]
    async fn valid_access_token_authenticates() {
        let collab = collaborators(StaticUserLookup::of(["u1"]));
        let access = mint_token(SECRET, "u1", 3600, None).unwrap();
        let user = authenticate_browser(&RelayConfig::default(), &collab, Some(&access), None)
            .await
            .unwrap();
        assert_eq!(user, "u1");
    }

    #[tokio::test]
    async fn expired_access_falls_through_to_refresh() {
        let collab = collaborators(StaticUserLookup::of(["u1"]));
        let access = mint_token(SECRET, "u1", -3600, None).unwrap();
        let refresh = mint_token(SECRET, "u1", 3600, Some(REFRESH_TOKEN_TYPE)).unwrap();
        let user = authenticate_browser(
            &RelayConfig::default(),
            &collab,
            Some(&access),
            Some(&refresh),
        )
        .await
        .unwrap();
        assert_eq!(user, "u1");
    }

    #[tokio::test]
    async fn expired_refresh_fails() {
        let collab = collaborators(StaticUserLookup::of(["u1"]));
        let access = mint_token(SECRET, "u1", -3600, None).unwrap();
        let refresh = mint_token(SECRET, "u1", -3600, Some(REFRESH_TOKEN_TYPE)).unwrap();
        let result = authenticate_browser(
            &RelayConfig::default(),
            &collab,
            Some(&access),
            Some(&refresh),
        )
        .await;
        assert!(matches!(result, Err(RelayError::AuthRejected)));
    }

    #[tokio::test]
    async fn refresh_without_type_claim_fails() {
        let collab = collaborators(StaticUserLookup::of(["u1"]));
        let refresh = mint_token(SECRET, "u1", 3600, None).unwrap();
        let result =
            authenticate_browser(&RelayConfig::default(), &collab, None, Some(&refresh)).await;
        assert!(matches!(result, Err(RelayError::AuthRejected)));
    }

    #[tokio::test]
    async fn invalid_access_does_not_fall_through() {
        let collab = collaborators(StaticUserLookup::of(["u1"]));
        let access = mint_token("other-secret", "u1", 3600, None).unwrap();
        let refresh = mint_token(SECRET, "u1", 3600, Some(REFRESH_TOKEN_TYPE)).unwrap();
        let result = authenticate_browser(
            &RelayConfig::default(),
            &collab,
            Some(&access),
            Some(&refresh),
        )
        .await;
        assert!(matches!(result, Err(RelayError::AuthRejected)));
    }

    #[tokio::test]
    async fn unknown_subject_fails_lookup() {
        let collab = collaborators(StaticUserLookup::of(["someone-else"]));
        let access = mint_token(SECRET, "u1", 3600, None).unwrap();
        let result =
            authenticate_browser(&RelayConfig::default(), &collab, Some(&access), None).await;
        assert!(matches!(result, Err(RelayError::AuthRejected)));
    }

    #[tokio::test]
    async fn dev_bypass_synthesises_user() {
        let collab = Collaborators::for_tests();
        let mut config = RelayConfig::default();
        config.dev_user = Some("dev".into());
        let user = authenticate_browser(&config, &collab, None, None)
            .await
            .unwrap();
        assert_eq!(user, "dev");
    }

    #[tokio::test]
    async fn no_provider_and_no_dev_user_rejects() {
        let collab = Collaborators::for_tests();
        let result = authenticate_browser(&RelayConfig::default(), &collab, None, None).await;
        assert!(matches!(result, Err(RelayError::AuthRejected)));
    }

    #[tokio::test]
    async fn agent_tokens_resolve_owner() {
        let tokens = JwtAgentTokens::new(SECRET);
        let token = mint_token(SECRET, "u1", 3600, None).unwrap();
        assert_eq!(tokens.verify(&token).await.unwrap(), "u1");
        assert!(tokens.verify("garbage").await.is_err());
    }
}
