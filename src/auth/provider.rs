//! Identity provider trait definition

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;

use super::{AccessToken, AccountHandle, ApplicationIdentity};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No usable session: refresh token expired or revoked, consent missing.
    #[error("user interaction required: {0}")]
    ConsentRequired(String),
    /// Network, HTTP or protocol failure unrelated to consent.
    #[error("{0}")]
    Transient(String),
}

/// Tokens issued by the token endpoint
#[derive(Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    #[serde(default)]
    pub id_token: Option<String>,
}

fn default_expires_in() -> i64 {
    3600
}

impl TokenGrant {
    pub fn access_token(&self) -> AccessToken {
        AccessToken::new(self.access_token.clone())
    }

    pub fn claims(&self) -> Option<IdTokenClaims> {
        self.id_token.as_deref().and_then(IdTokenClaims::decode)
    }
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_id_token", &self.id_token.is_some())
            .finish()
    }
}

/// The subset of id_token claims used to identify an account
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdTokenClaims {
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub tid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
}

impl IdTokenClaims {
    /// Decode the payload segment of a JWT without verifying it; the token
    /// came straight from the token endpoint over TLS.
    pub fn decode(id_token: &str) -> Option<Self> {
        let payload = id_token.split('.').nth(1)?;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn account_handle(&self) -> Option<AccountHandle> {
        match (self.oid.as_deref(), self.tid.as_deref()) {
            (Some(oid), Some(tid)) if !oid.is_empty() && !tid.is_empty() => {
                Some(AccountHandle::from_claims(oid, tid))
            }
            _ => None,
        }
    }

    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .or(self.preferred_username.as_deref())
            .unwrap_or("Unknown account")
            .to_string()
    }
}

/// Remote identity provider endpoints.
///
/// Account enumeration and removal are answered from the local token cache,
/// so only token issuance and validation go over the network.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Redeem a refresh token without user interaction
    async fn refresh(
        &self,
        app: &ApplicationIdentity,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenGrant, ProviderError>;

    /// Run a user-facing consent flow. `login_hint` pre-selects an account
    /// when the provider supports it.
    async fn interactive(
        &self,
        app: &ApplicationIdentity,
        scopes: &[String],
        login_hint: Option<&str>,
    ) -> Result<TokenGrant, ProviderError>;

    /// One lightweight authenticated call proving the token is accepted
    async fn validate(&self, token: &AccessToken) -> Result<(), ProviderError>;
}

/// What the user needs to finish a device-code consent flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentChallenge {
    pub user_code: String,
    pub verification_uri: String,
    pub message: Option<String>,
}

/// Shows a consent challenge to the user (browser launch, key title,
/// property inspector). Supplied by the host.
pub trait ConsentPresenter: Send + Sync {
    fn present(&self, app: &ApplicationIdentity, challenge: &ConsentChallenge);
}

/// Presenter that only logs the challenge
pub struct LogConsentPresenter;

impl ConsentPresenter for LogConsentPresenter {
    fn present(&self, app: &ApplicationIdentity, challenge: &ConsentChallenge) {
        tracing::info!(
            "Sign-in required for {}: open {} and enter code {}",
            app,
            challenge.verification_uri,
            challenge.user_code
        );
    }
}

#[cfg(test)]
pub(crate) fn fake_id_token(oid: &str, tid: &str, name: &str) -> String {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header = engine.encode(br#"{"alg":"none"}"#);
    let payload = engine.encode(
        serde_json::json!({
            "oid": oid,
            "tid": tid,
            "name": name,
            "preferred_username": format!("{}@contoso.com", name.to_lowercase()),
        })
        .to_string(),
    );
    format!("{}.{}.", header, payload)
}
