//! In-process account-removal fan-out
//!
//! One [`AccountNotifier`] is created by the plugin context and handed to
//! every action at construction. Removing an account in one action tells
//! every other action bound to the same application identity to forget it.

use std::sync::{Arc, RwLock};

use crate::auth::{AccountHandle, ApplicationIdentity};

pub trait AccountListener: Send + Sync {
    /// Identity this listener is currently bound to. Read on every publish,
    /// so a listener that reconfigures is matched against its new identity.
    fn application_id(&self) -> ApplicationIdentity;

    fn on_account_removed(&self, account: &AccountHandle);
}

#[derive(Default)]
pub struct AccountNotifier {
    listeners: RwLock<Vec<Arc<dyn AccountListener>>>,
}

impl AccountNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same listener twice keeps a single registration.
    pub fn subscribe(&self, listener: Arc<dyn AccountListener>) {
        let mut listeners = match self.listeners.write() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !listeners.iter().any(|existing| Arc::ptr_eq(existing, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn unsubscribe(&self, listener: &Arc<dyn AccountListener>) {
        let mut listeners = match self.listeners.write() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        listeners.retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Deliver synchronously, in registration order, to listeners whose
    /// identity matches case-insensitively. Returns how many were told.
    ///
    /// Handlers run outside the registry lock so they may unsubscribe
    /// themselves. A panicking handler is not caught.
    pub fn publish_account_removed(
        &self,
        app: &ApplicationIdentity,
        account: &AccountHandle,
    ) -> usize {
        let snapshot: Vec<Arc<dyn AccountListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        let mut delivered = 0;
        for listener in snapshot {
            if listener.application_id().matches(app) {
                listener.on_account_removed(account);
                delivered += 1;
            }
        }
        tracing::debug!("Account {} removal for {} delivered to {} listener(s)", account, app, delivered);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        app: ApplicationIdentity,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl AccountListener for Recorder {
        fn application_id(&self) -> ApplicationIdentity {
            self.app.clone()
        }

        fn on_account_removed(&self, account: &AccountHandle) {
            self.log.lock().unwrap().push(format!("{}:{}", self.name, account));
        }
    }

    fn recorder(name: &'static str, app: &str, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn AccountListener> {
        Arc::new(Recorder {
            name,
            app: ApplicationIdentity::new(app),
            log: log.clone(),
        })
    }

    fn acct(id: &str) -> AccountHandle {
        AccountHandle::from_settings(id).unwrap()
    }

    #[test]
    fn publish_reaches_only_matching_identities_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let notifier = AccountNotifier::new();
        notifier.subscribe(recorder("first", "app-A", &log));
        notifier.subscribe(recorder("other", "app-B", &log));
        notifier.subscribe(recorder("second", "APP-a", &log));

        let delivered = notifier.publish_account_removed(&ApplicationIdentity::new("app-A"), &acct("acct-1"));

        assert_eq!(delivered, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:acct-1".to_string(), "second:acct-1".to_string()]
        );
    }

    #[test]
    fn subscribe_and_unsubscribe_are_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let notifier = AccountNotifier::new();
        let listener = recorder("only", "app", &log);

        notifier.subscribe(listener.clone());
        notifier.subscribe(listener.clone());
        assert_eq!(notifier.listener_count(), 1);

        notifier.publish_account_removed(&ApplicationIdentity::new("app"), &acct("a"));
        assert_eq!(log.lock().unwrap().len(), 1);

        notifier.unsubscribe(&listener);
        notifier.unsubscribe(&listener);
        assert_eq!(notifier.listener_count(), 0);

        let never_registered = recorder("ghost", "app", &log);
        notifier.unsubscribe(&never_registered);
        assert_eq!(notifier.publish_account_removed(&ApplicationIdentity::new("app"), &acct("a")), 0);
    }

    struct SelfRemoving {
        notifier: Arc<AccountNotifier>,
        me: Mutex<Option<Arc<dyn AccountListener>>>,
    }

    impl AccountListener for SelfRemoving {
        fn application_id(&self) -> ApplicationIdentity {
            ApplicationIdentity::new("app")
        }

        fn on_account_removed(&self, _account: &AccountHandle) {
            if let Some(me) = self.me.lock().unwrap().take() {
                self.notifier.unsubscribe(&me);
            }
        }
    }

    #[test]
    fn handler_may_unsubscribe_during_publish() {
        let notifier = Arc::new(AccountNotifier::new());
        let listener = Arc::new(SelfRemoving {
            notifier: notifier.clone(),
            me: Mutex::new(None),
        });
        let as_dyn: Arc<dyn AccountListener> = listener.clone();
        *listener.me.lock().unwrap() = Some(as_dyn.clone());
        notifier.subscribe(as_dyn);

        assert_eq!(notifier.publish_account_removed(&ApplicationIdentity::new("app"), &acct("a")), 1);
        assert_eq!(notifier.listener_count(), 0);
    }
}
