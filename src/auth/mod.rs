//! Identity-provider session management
//!
//! Each plugin instance owns one [`AccountAuthenticator`] bound to an
//! application identity (the OAuth client registration) and, optionally, one
//! cached account. Tokens live in the shared [`TokenCache`](crate::storage::TokenCache),
//! so several instances bound to the same identity see the same accounts.
//!
//! Background work (timer ticks) must never open a consent prompt; every
//! call that may do so takes an explicit [`InteractionPolicy`].

mod authenticator;
mod directory;
pub mod microsoft;
mod provider;
#[cfg(test)]
pub(crate) mod testing;

pub use authenticator::AccountAuthenticator;
pub use directory::AccountDirectory;
pub use provider::*;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::CacheError;

/// OAuth client registration a plugin instance authenticates as
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationIdentity(String);

impl ApplicationIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Identities compare case-insensitively everywhere they are matched.
    pub fn matches(&self, other: &ApplicationIdentity) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }

    pub(crate) fn cache_key(&self) -> String {
        format!("token-cache:{}", self.0.to_ascii_lowercase())
    }
}

impl fmt::Display for ApplicationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ApplicationIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Opaque identifier of one cached account within an identity's cache.
///
/// Minted from id-token claims when an account is added; callers only ever
/// echo values previously returned by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountHandle(String);

impl AccountHandle {
    pub(crate) fn from_claims(object_id: &str, tenant_id: &str) -> Self {
        Self(format!("{}.{}", object_id, tenant_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, other: &AccountHandle) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }

    /// Rehydrate a handle echoed back from persisted settings.
    pub fn from_settings(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }
}

impl fmt::Display for AccountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bearer token for the Graph API. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Whether a call may fall back to a user-facing consent flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionPolicy {
    /// Cached credentials only. Used by timer-driven polling.
    SilentOnly,
    /// Fall back to the consent flow when the provider asks for it.
    AllowInteractive,
}

impl InteractionPolicy {
    pub fn allows_prompt(self) -> bool {
        matches!(self, InteractionPolicy::AllowInteractive)
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Application identity or account is not configured")]
    Configuration,
    #[error("Sign-in required")]
    ConsentRequired,
    #[error("Identity provider failure: {0}")]
    Provider(String),
    #[error("Signed in as a different account than the one configured")]
    AccountMismatch,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ConsentRequired(reason) => {
                tracing::debug!("Provider requires consent: {}", reason);
                AuthError::ConsentRequired
            }
            ProviderError::Transient(message) => AuthError::Provider(message),
        }
    }
}

/// Outcome of [`AccountAuthenticator::initialize`]; initialization never fails
/// outright, it degrades to `Unready`.
#[derive(Debug)]
pub enum Readiness {
    Ready,
    Unready(AuthError),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}
