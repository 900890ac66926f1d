//! Process-wide plugin context
//!
//! Built once by the host integration and shared by every action. Owns the
//! token cache, the remote clients, the account notifier and the badge
//! scheduler; nothing in the crate reaches for globals instead.

use std::sync::Arc;

use crate::animation::{glyph_data_uri, BadgeScheduler, Renderer, SvgBadgeRenderer};
use crate::auth::microsoft::MicrosoftIdentityProvider;
use crate::auth::{
    AccountAuthenticator, AccountDirectory, AccountHandle, ApplicationIdentity, ConsentPresenter,
    IdentityProvider,
};
use crate::actions::ActionKind;
use crate::config::PluginConfig;
use crate::graph::{GraphApi, GraphClient};
use crate::notifier::AccountNotifier;
use crate::storage::{KeyringBackend, TokenCache, TokenCacheBackend};

pub struct PluginContext {
    config: PluginConfig,
    cache: Arc<TokenCache>,
    provider: Arc<dyn IdentityProvider>,
    graph: Arc<dyn GraphApi>,
    notifier: Arc<AccountNotifier>,
    scheduler: Arc<BadgeScheduler>,
}

impl PluginContext {
    pub fn new(
        config: PluginConfig,
        backend: Arc<dyn TokenCacheBackend>,
        provider: Arc<dyn IdentityProvider>,
        graph: Arc<dyn GraphApi>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let scheduler = Arc::new(BadgeScheduler::new(renderer, config.animation.clone()));
        Self {
            cache: Arc::new(TokenCache::new(backend)),
            provider,
            graph,
            notifier: Arc::new(AccountNotifier::new()),
            scheduler,
            config,
        }
    }

    /// Production wiring: OS keychain, Entra ID, Graph, SVG badges
    pub fn from_config(config: PluginConfig, presenter: Arc<dyn ConsentPresenter>) -> Self {
        let backend = Arc::new(KeyringBackend::with_service(config.keyring_service.clone()));
        let provider = Arc::new(MicrosoftIdentityProvider::new(&config, presenter));
        let graph = Arc::new(GraphClient::new(&config));
        Self::new(config, backend, provider, graph, Arc::new(SvgBadgeRenderer))
    }

    /// Fresh, uninitialized session. Blank values leave it unconfigured.
    pub fn configure(&self, app: &str, account: Option<&str>) -> Arc<AccountAuthenticator> {
        let app = ApplicationIdentity::new(app);
        let account = account.and_then(AccountHandle::from_settings);
        tracing::debug!(
            "Configuring session for '{}' ({})",
            app,
            account.as_ref().map(|a| a.as_str()).unwrap_or("no account")
        );
        Arc::new(AccountAuthenticator::new(
            app,
            account,
            self.cache.clone(),
            self.provider.clone(),
            &self.config,
        ))
    }

    pub fn directory(&self) -> AccountDirectory {
        AccountDirectory::new(self.cache.clone(), self.notifier.clone())
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<dyn GraphApi> {
        &self.graph
    }

    pub fn notifier(&self) -> &Arc<AccountNotifier> {
        &self.notifier
    }

    pub fn scheduler(&self) -> &Arc<BadgeScheduler> {
        &self.scheduler
    }

    /// Inline PNG for the action's corner glyph, if the asset is present
    pub fn glyph_for(&self, kind: ActionKind) -> Option<String> {
        let path = self.config.assets_dir.join(kind.glyph_file());
        match glyph_data_uri(&path) {
            Ok(uri) => Some(uri),
            Err(err) => {
                tracing::debug!("No glyph for {:?}: {:#}", kind, err);
                None
            }
        }
    }
}
