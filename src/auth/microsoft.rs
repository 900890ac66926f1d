//! Microsoft identity platform (Entra ID) provider
//!
//! Endpoints:
//! - {authority}/oauth2/v2.0/token - Refresh-token and device-code redemption
//! - {authority}/oauth2/v2.0/devicecode - Device authorization for interactive consent
//! - graph.microsoft.com/v1.0/me - Token validation

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::{
    AccessToken, ApplicationIdentity, ConsentChallenge, ConsentPresenter, IdentityProvider,
    ProviderError, TokenGrant,
};
use crate::config::PluginConfig;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Token endpoint errors that mean "ask the user again"
const CONSENT_ERRORS: &[&str] = &[
    "invalid_grant",
    "interaction_required",
    "consent_required",
    "login_required",
    "expired_token",
    "access_denied",
    "authorization_declined",
];

pub struct MicrosoftIdentityProvider {
    client: reqwest::Client,
    authority: String,
    graph_base_url: String,
    presenter: Arc<dyn ConsentPresenter>,
}

impl MicrosoftIdentityProvider {
    pub fn new(config: &PluginConfig, presenter: Arc<dyn ConsentPresenter>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();

        Self {
            client,
            authority: config.authority(),
            graph_base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            presenter,
        }
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }

    fn device_code_url(&self) -> String {
        format!("{}/oauth2/v2.0/devicecode", self.authority)
    }

    async fn post_token(&self, params: &[(&str, &str)]) -> Result<TokenGrant, TokenFailure> {
        let response = self
            .client
            .post(self.token_url())
            .header("Accept", "application/json")
            .form(params)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("Token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("Token response unreadable: {}", e)))?;

        if status.is_success() {
            return serde_json::from_str::<TokenGrant>(&body).map_err(|e| {
                ProviderError::Transient(format!("Unexpected token response: {}", e)).into()
            });
        }

        Err(token_failure(status, &body))
    }

    async fn request_device_code(
        &self,
        app: &ApplicationIdentity,
        scope: &str,
    ) -> Result<DeviceCodeResponse, ProviderError> {
        let params = [("client_id", app.as_str()), ("scope", scope)];

        let response = self
            .client
            .post(self.device_code_url())
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("Device code request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transient(format!("Device code response unreadable: {}", e)))?;

        if !status.is_success() {
            return Err(classify_error_body(status, &body));
        }

        let device_code: DeviceCodeResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::Transient(format!("Unexpected device code response: {}", e)))?;
        tracing::info!("Got device code for {}, user should enter: {}", app, device_code.user_code);
        Ok(device_code)
    }

    /// Poll the token endpoint until the user finishes (or abandons) consent
    async fn poll_for_token(
        &self,
        app: &ApplicationIdentity,
        device_code: &DeviceCodeResponse,
    ) -> Result<TokenGrant, ProviderError> {
        let params = [
            ("client_id", app.as_str()),
            ("device_code", device_code.device_code.as_str()),
            ("grant_type", DEVICE_CODE_GRANT),
        ];

        let deadline = tokio::time::Instant::now() + Duration::from_secs(device_code.expires_in.max(1));
        let mut current_interval = device_code.interval.max(1);

        loop {
            tokio::time::sleep(Duration::from_secs(current_interval)).await;
            if tokio::time::Instant::now() >= deadline {
                return Err(ProviderError::ConsentRequired("Device code expired".to_string()));
            }

            let failure = match self.post_token(&params).await {
                Ok(grant) => {
                    tracing::info!("Device code consent completed for {}", app);
                    return Ok(grant);
                }
                Err(failure) => failure,
            };

            match poll_step(failure)? {
                PollStep::Pending => {
                    tracing::debug!("Authorization pending, continuing to poll...");
                }
                PollStep::SlowDown => {
                    current_interval += 5;
                    tracing::debug!("Slowing down, new interval: {}s", current_interval);
                }
            }
        }
    }
}

#[async_trait]
impl IdentityProvider for MicrosoftIdentityProvider {
    async fn refresh(
        &self,
        app: &ApplicationIdentity,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenGrant, ProviderError> {
        let scope = scopes.join(" ");
        let params = [
            ("client_id", app.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];
        let grant = self.post_token(&params).await.map_err(ProviderError::from)?;
        tracing::debug!("Refreshed access token for {}", app);
        Ok(grant)
    }

    async fn interactive(
        &self,
        app: &ApplicationIdentity,
        scopes: &[String],
        login_hint: Option<&str>,
    ) -> Result<TokenGrant, ProviderError> {
        if let Some(hint) = login_hint {
            tracing::debug!("Device code flow cannot pre-select {}; user picks the account", hint);
        }

        let scope = scopes.join(" ");
        let device_code = self.request_device_code(app, &scope).await?;

        self.presenter.present(
            app,
            &ConsentChallenge {
                user_code: device_code.user_code.clone(),
                verification_uri: device_code.verification_uri.clone(),
                message: device_code.message.clone(),
            },
        );

        self.poll_for_token(app, &device_code).await
    }

    async fn validate(&self, token: &AccessToken) -> Result<(), ProviderError> {
        let response = self
            .client
            .get(format!("{}/me", self.graph_base_url))
            .bearer_auth(token.secret())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("Graph /me failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ProviderError::ConsentRequired("Graph rejected the token".to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Transient(format!("Graph /me returned status: {}", status)));
        }
        Ok(())
    }
}

/// Token endpoint failure, before it is folded into a [`ProviderError`].
/// OAuth error codes stay structured so the device-code poller can match
/// on them.
#[derive(Debug)]
enum TokenFailure {
    OAuth {
        status: reqwest::StatusCode,
        error: OAuthErrorResponse,
    },
    Other(ProviderError),
}

impl From<ProviderError> for TokenFailure {
    fn from(err: ProviderError) -> Self {
        TokenFailure::Other(err)
    }
}

impl From<TokenFailure> for ProviderError {
    fn from(failure: TokenFailure) -> Self {
        match failure {
            TokenFailure::OAuth { status, error } => classify_oauth_error(status, error),
            TokenFailure::Other(err) => err,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PollStep {
    Pending,
    SlowDown,
}

/// Keep polling on `authorization_pending` / `slow_down`; anything else
/// ends the device-code flow.
fn poll_step(failure: TokenFailure) -> Result<PollStep, ProviderError> {
    match failure {
        TokenFailure::OAuth { error, status } => match error.error.as_str() {
            "authorization_pending" => Ok(PollStep::Pending),
            "slow_down" => Ok(PollStep::SlowDown),
            _ => Err(classify_oauth_error(status, error)),
        },
        TokenFailure::Other(err) => Err(err),
    }
}

fn token_failure(status: reqwest::StatusCode, body: &str) -> TokenFailure {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(error) => TokenFailure::OAuth { status, error },
        Err(_) => TokenFailure::Other(ProviderError::Transient(format!(
            "Identity provider returned status: {}",
            status
        ))),
    }
}

/// Map a token-endpoint error body onto the consent / transient split.
fn classify_error_body(status: reqwest::StatusCode, body: &str) -> ProviderError {
    token_failure(status, body).into()
}

fn classify_oauth_error(status: reqwest::StatusCode, error: OAuthErrorResponse) -> ProviderError {
    let description = error.error_description.unwrap_or_default();
    let first_line = description.lines().next().unwrap_or_default();
    if CONSENT_ERRORS.contains(&error.error.as_str()) {
        ProviderError::ConsentRequired(format!("{}: {}", error.error, first_line))
    } else {
        ProviderError::Transient(format!("{} ({}): {}", error.error, status, first_line))
    }
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
    #[serde(default)]
    message: Option<String>,
}

fn default_interval() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    error_description: Option<String>,
}
