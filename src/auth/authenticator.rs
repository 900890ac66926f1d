use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::{
    AccessToken, AccountHandle, ApplicationIdentity, AuthError, IdentityProvider,
    InteractionPolicy, ProviderError, Readiness, TokenGrant,
};
use crate::config::PluginConfig;
use crate::storage::{CacheDocument, CachedAccount, TokenCache};

/// One plugin instance's session with the identity provider.
///
/// Sessions are never mutated in place: a settings change builds a new one
/// and drops the old. `ready` only turns true after a token for the bound
/// account has been accepted by the provider.
pub struct AccountAuthenticator {
    app: ApplicationIdentity,
    account: Option<AccountHandle>,
    ready: AtomicBool,
    cache: Arc<TokenCache>,
    provider: Arc<dyn IdentityProvider>,
    scopes: Vec<String>,
    request_timeout: Duration,
    refresh_skew: chrono::Duration,
}

impl AccountAuthenticator {
    pub fn new(
        app: ApplicationIdentity,
        account: Option<AccountHandle>,
        cache: Arc<TokenCache>,
        provider: Arc<dyn IdentityProvider>,
        config: &PluginConfig,
    ) -> Self {
        Self {
            app,
            account,
            ready: AtomicBool::new(false),
            cache,
            provider,
            scopes: config.scopes.clone(),
            request_timeout: config.request_timeout(),
            refresh_skew: config.token_refresh_skew(),
        }
    }

    pub fn application(&self) -> &ApplicationIdentity {
        &self.app
    }

    pub fn account(&self) -> Option<&AccountHandle> {
        self.account.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_configured(&self) -> bool {
        !self.app.is_empty() && self.account.is_some()
    }

    /// Acquire a token for the bound account and prove it against the
    /// provider. Unconfigured sessions return `Unready` without any network
    /// traffic.
    pub async fn initialize(&self, policy: InteractionPolicy) -> Readiness {
        if !self.is_configured() {
            tracing::debug!("Session for '{}' has no account bound; staying unready", self.app);
            return Readiness::Unready(AuthError::Configuration);
        }

        match self.validate_session(policy).await {
            Ok(()) => {
                self.ready.store(true, Ordering::SeqCst);
                tracing::info!("Session ready for {} ({})", self.app, self.describe_account());
                Readiness::Ready
            }
            Err(err) => {
                tracing::warn!("Session for {} is not ready: {}", self.app, err);
                Readiness::Unready(err)
            }
        }
    }

    async fn validate_session(&self, policy: InteractionPolicy) -> Result<(), AuthError> {
        let token = self.acquire_access_token(policy).await?;
        self.with_timeout("validate", self.provider.validate(&token)).await
    }

    /// Silent first; the consent flow only runs when the provider asked for
    /// it and the caller opted in.
    pub async fn acquire_access_token(
        &self,
        policy: InteractionPolicy,
    ) -> Result<AccessToken, AuthError> {
        let account = self.bound_account()?;

        match self.acquire_silent(account).await {
            Err(AuthError::ConsentRequired) if policy.allows_prompt() => {
                tracing::info!("Silent sign-in failed for {}; starting consent flow", self.app);
                self.acquire_interactive(account).await
            }
            result => result,
        }
    }

    async fn acquire_silent(&self, account: &AccountHandle) -> Result<AccessToken, AuthError> {
        let document = self.cache.load(&self.app).await?;
        let (handle, cached) = find_account(&document, account).ok_or(AuthError::ConsentRequired)?;

        if let Some(token) = cached.fresh_access_token(Utc::now(), self.refresh_skew) {
            return Ok(AccessToken::new(token));
        }
        if cached.refresh_token.is_empty() {
            return Err(AuthError::ConsentRequired);
        }

        let grant = self
            .with_timeout(
                "refresh",
                self.provider.refresh(&self.app, &cached.refresh_token, &self.scopes),
            )
            .await?;
        self.store_grant(Some(handle), &grant).await?;
        Ok(grant.access_token())
    }

    async fn acquire_interactive(&self, account: &AccountHandle) -> Result<AccessToken, AuthError> {
        let login_hint = match self.cache.load(&self.app).await {
            Ok(document) => find_account(&document, account).and_then(|(_, a)| a.username.clone()),
            Err(_) => None,
        };

        let grant = self
            .provider
            .interactive(&self.app, &self.scopes, login_hint.as_deref())
            .await?;
        let handle = self.store_grant(None, &grant).await?;

        if !handle.matches(account) {
            tracing::warn!("Consent flow for {} returned account {} instead of {}", self.app, handle, account);
            return Err(AuthError::AccountMismatch);
        }
        Ok(grant.access_token())
    }

    /// Enumerate cached accounts for this identity. Never fails: an unset
    /// identity or unreadable cache yields an empty map.
    pub async fn list_accounts(&self) -> BTreeMap<AccountHandle, String> {
        list_cached_accounts(&self.cache, &self.app).await
    }

    /// Drop an account's tokens. Revoking an absent handle succeeds.
    pub async fn revoke_account(&self, handle: &AccountHandle) -> Result<(), AuthError> {
        let result = remove_cached_account(&self.cache, &self.app, handle).await;
        self.ready.store(false, Ordering::SeqCst);
        result
    }

    /// Run the consent flow with no account pre-selected. The new account is
    /// cached but not bound to this session.
    pub async fn start_new_account_flow(&self) -> Result<AccountHandle, AuthError> {
        if self.app.is_empty() {
            return Err(AuthError::Configuration);
        }

        let grant = self.provider.interactive(&self.app, &self.scopes, None).await?;
        let handle = self.store_grant(None, &grant).await?;
        tracing::info!("Added account {} for {}", handle, self.app);
        Ok(handle)
    }

    fn bound_account(&self) -> Result<&AccountHandle, AuthError> {
        match &self.account {
            Some(account) if !self.app.is_empty() => Ok(account),
            _ => Err(AuthError::Configuration),
        }
    }

    fn describe_account(&self) -> &str {
        self.account.as_ref().map(|a| a.as_str()).unwrap_or("-")
    }

    async fn with_timeout<T, F>(&self, call: &str, fut: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(AuthError::from),
            Err(_) => Err(AuthError::Provider(format!(
                "{} timed out after {}s",
                call,
                self.request_timeout.as_secs()
            ))),
        }
    }

    /// Write a grant into the cache and return the account it belongs to.
    /// `known` wins over id-token claims (refresh responses may omit them).
    ///
    /// A `known` account that is no longer cached was revoked while the
    /// grant was in flight; its tokens are dropped and the caller gets
    /// `ConsentRequired`.
    async fn store_grant(
        &self,
        known: Option<&AccountHandle>,
        grant: &TokenGrant,
    ) -> Result<AccountHandle, AuthError> {
        let claims = grant.claims();
        let handle = known
            .cloned()
            .or_else(|| claims.as_ref().and_then(|c| c.account_handle()))
            .ok_or_else(|| {
                AuthError::Provider("Token response did not identify the account".to_string())
            })?;

        let expires_at = Utc::now() + chrono::Duration::seconds(grant.expires_in.max(0));
        let access_token = grant.access_token.clone();
        let refresh_token = grant.refresh_token.clone();
        let key = handle.clone();
        let refreshing = known.is_some();

        let stored = self
            .cache
            .update(&self.app, move |document| match document.accounts.entry(key) {
                Entry::Occupied(mut entry) => {
                    let account = entry.get_mut();
                    account.access_token = Some(access_token);
                    account.expires_at = Some(expires_at);
                    if let Some(refresh_token) = refresh_token {
                        account.refresh_token = refresh_token;
                    }
                    if let Some(claims) = claims {
                        account.display_name = claims.display_name();
                        if claims.preferred_username.is_some() {
                            account.username = claims.preferred_username;
                        }
                    }
                    true
                }
                Entry::Vacant(_) if refreshing => false,
                Entry::Vacant(entry) => {
                    let claims = claims.unwrap_or_default();
                    entry.insert(CachedAccount {
                        display_name: claims.display_name(),
                        username: claims.preferred_username,
                        refresh_token: refresh_token.unwrap_or_default(),
                        access_token: Some(access_token),
                        expires_at: Some(expires_at),
                    });
                    true
                }
            })
            .await?;

        if !stored {
            tracing::info!("Account {} was removed from {} during refresh; discarding tokens", handle, self.app);
            return Err(AuthError::ConsentRequired);
        }
        Ok(handle)
    }
}

fn find_account<'a>(
    document: &'a CacheDocument,
    wanted: &AccountHandle,
) -> Option<(&'a AccountHandle, &'a CachedAccount)> {
    document
        .accounts
        .get_key_value(wanted)
        .or_else(|| document.accounts.iter().find(|(handle, _)| handle.matches(wanted)))
}

pub(super) async fn list_cached_accounts(
    cache: &TokenCache,
    app: &ApplicationIdentity,
) -> BTreeMap<AccountHandle, String> {
    if app.is_empty() {
        return BTreeMap::new();
    }

    match cache.load(app).await {
        Ok(document) => document
            .accounts
            .into_iter()
            .map(|(handle, account)| (handle, account.display_name))
            .collect(),
        Err(err) => {
            tracing::warn!("Could not read cached accounts for {}: {}", app, err);
            BTreeMap::new()
        }
    }
}

pub(super) async fn remove_cached_account(
    cache: &TokenCache,
    app: &ApplicationIdentity,
    handle: &AccountHandle,
) -> Result<(), AuthError> {
    if app.is_empty() {
        return Err(AuthError::Configuration);
    }

    let wanted = handle.clone();
    let removed = cache
        .update(app, move |document| {
            let matching: Vec<AccountHandle> = document
                .accounts
                .keys()
                .filter(|candidate| candidate.matches(&wanted))
                .cloned()
                .collect();
            for key in &matching {
                document.accounts.remove(key);
            }
            !matching.is_empty()
        })
        .await?;

    if removed {
        tracing::info!("Removed account {} from {}", handle, app);
    } else {
        tracing::debug!("Account {} was not cached for {}", handle, app);
    }
    Ok(())
}
