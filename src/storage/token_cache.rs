//! Per-identity token cache on top of a [`TokenCacheBackend`]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::keyring::{CacheError, TokenCacheBackend};
use crate::auth::{AccountHandle, ApplicationIdentity};

/// Credentials for one signed-in account
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAccount {
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl CachedAccount {
    /// Cached access token, unless it expires within `skew`.
    pub fn fresh_access_token(&self, now: DateTime<Utc>, skew: Duration) -> Option<&str> {
        let token = self.access_token.as_deref()?;
        let expires_at = self.expires_at?;
        (expires_at - skew > now).then_some(token)
    }
}

impl fmt::Debug for CachedAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedAccount")
            .field("display_name", &self.display_name)
            .field("username", &self.username)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Everything cached for one application identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheDocument {
    #[serde(default)]
    pub accounts: BTreeMap<AccountHandle, CachedAccount>,
}

/// Shared token cache for every session in the process.
///
/// Reads take no lock. Read-modify-write updates are serialized per
/// application identity; different identities never wait on each other.
pub struct TokenCache {
    backend: Arc<dyn TokenCacheBackend>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenCache {
    pub fn new(backend: Arc<dyn TokenCacheBackend>) -> Self {
        Self {
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self, app: &ApplicationIdentity) -> Result<CacheDocument, CacheError> {
        Self::read_blocking(self.backend.clone(), app.cache_key()).await
    }

    /// Apply `mutate` to the identity's document and persist the result if it
    /// changed. An emptied document removes the backend entry.
    pub async fn update<F, R>(&self, app: &ApplicationIdentity, mutate: F) -> Result<R, CacheError>
    where
        F: FnOnce(&mut CacheDocument) -> R + Send,
        R: Send,
    {
        let key = app.cache_key();
        let lock = self.identity_lock(&key);
        let _guard = lock.lock().await;

        let before = Self::read_blocking(self.backend.clone(), key.clone()).await?;
        let mut document = before.clone();
        let result = mutate(&mut document);

        if document != before {
            let backend = self.backend.clone();
            let blob = if document.accounts.is_empty() {
                None
            } else {
                Some(serde_json::to_string(&document)?)
            };
            tokio::task::spawn_blocking(move || match blob {
                Some(blob) => backend.store(&key, &blob),
                None => backend.delete(&key),
            })
            .await
            .map_err(|err| CacheError::Task(err.to_string()))??;
        }

        Ok(result)
    }

    fn identity_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_blocking(
        backend: Arc<dyn TokenCacheBackend>,
        key: String,
    ) -> Result<CacheDocument, CacheError> {
        let blob = tokio::task::spawn_blocking(move || backend.load(&key))
            .await
            .map_err(|err| CacheError::Task(err.to_string()))??;
        match blob {
            Some(blob) => Ok(serde_json::from_str(&blob)?),
            None => Ok(CacheDocument::default()),
        }
    }
}
