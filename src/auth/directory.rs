use std::collections::BTreeMap;
use std::sync::Arc;

use super::authenticator::{list_cached_accounts, remove_cached_account};
use super::{AccountHandle, ApplicationIdentity, AuthError};
use crate::notifier::AccountNotifier;
use crate::storage::TokenCache;

/// Accounts cached per application identity, as shown in the property
/// inspector. Reads never mutate the cache.
#[derive(Clone)]
pub struct AccountDirectory {
    cache: Arc<TokenCache>,
    notifier: Arc<AccountNotifier>,
}

impl AccountDirectory {
    pub fn new(cache: Arc<TokenCache>, notifier: Arc<AccountNotifier>) -> Self {
        Self { cache, notifier }
    }

    pub async fn list(&self, app: &ApplicationIdentity) -> BTreeMap<AccountHandle, String> {
        list_cached_accounts(&self.cache, app).await
    }

    /// Remove the account and tell every action bound to `app`.
    pub async fn revoke(&self, app: &ApplicationIdentity, account: &AccountHandle) -> Result<(), AuthError> {
        remove_cached_account(&self.cache, app, account).await?;
        self.notifier.publish_account_removed(app, account);
        Ok(())
    }
}
