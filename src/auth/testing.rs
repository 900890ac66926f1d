//! Scripted identity provider shared by the crate's tests

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::provider::fake_id_token;
use super::{AccessToken, ApplicationIdentity, IdentityProvider, ProviderError, TokenGrant};

pub(crate) fn grant_for(oid: &str, tid: &str, name: &str, access_token: &str) -> TokenGrant {
    TokenGrant {
        access_token: access_token.to_string(),
        refresh_token: Some(format!("rt-{}", access_token)),
        expires_in: 3600,
        id_token: Some(fake_id_token(oid, tid, name)),
    }
}

pub(crate) struct ScriptedProvider {
    pub refresh: Mutex<Result<TokenGrant, ProviderError>>,
    pub interactive: Mutex<Result<TokenGrant, ProviderError>>,
    pub validate: Mutex<Result<(), ProviderError>>,
    pub refresh_delay: Mutex<Option<Duration>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            refresh: Mutex::new(Err(ProviderError::ConsentRequired("no script".to_string()))),
            interactive: Mutex::new(Err(ProviderError::ConsentRequired("no script".to_string()))),
            validate: Mutex::new(Ok(())),
            refresh_delay: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn on_refresh(&self, result: Result<TokenGrant, ProviderError>) {
        *self.refresh.lock().unwrap() = result;
    }

    pub fn on_interactive(&self, result: Result<TokenGrant, ProviderError>) {
        *self.interactive.lock().unwrap() = result;
    }

    pub fn on_validate(&self, result: Result<(), ProviderError>) {
        *self.validate.lock().unwrap() = result;
    }

    pub fn delay_refresh(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl IdentityProvider for ScriptedProvider {
    async fn refresh(
        &self,
        app: &ApplicationIdentity,
        refresh_token: &str,
        _scopes: &[String],
    ) -> Result<TokenGrant, ProviderError> {
        self.record(format!("refresh:{}:{}", app, refresh_token));
        let delay = *self.refresh_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.refresh.lock().unwrap().clone()
    }

    async fn interactive(
        &self,
        app: &ApplicationIdentity,
        _scopes: &[String],
        login_hint: Option<&str>,
    ) -> Result<TokenGrant, ProviderError> {
        self.record(format!("interactive:{}:{}", app, login_hint.unwrap_or("-")));
        self.interactive.lock().unwrap().clone()
    }

    async fn validate(&self, token: &AccessToken) -> Result<(), ProviderError> {
        self.record(format!("validate:{}", token.secret()));
        self.validate.lock().unwrap().clone()
    }
}
