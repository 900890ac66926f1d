//! Stream Deck actions
//!
//! One [`BadgeAction`] exists per key the user placed. The host integration
//! forwards its events (settings, ticks, key presses, property inspector
//! messages) and provides the [`PluginHost`] side channel back.

mod settings;

pub use settings::{
    default_settings_for, is_blank_payload, ActionKind, ActionSettings, CalendarSettings,
    MailSettings,
};

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::animation::{AnimationRequest, FrameSink, SlotId};
use crate::auth::{
    AccountAuthenticator, AccountHandle, ApplicationIdentity, AuthError, InteractionPolicy,
};
use crate::badge;
use crate::context::PluginContext;
use crate::graph::{events_for_today_or_tomorrow, GraphError};
use crate::notifier::AccountListener;

const CALENDAR_URL: &str = "https://outlook.live.com/calendar";
const MAIL_URL: &str = "https://outlook.live.com/mail";

/// What an action needs from the Stream Deck connection
#[async_trait]
pub trait PluginHost: Send + Sync {
    async fn set_settings(&self, context: &str, settings: Value) -> anyhow::Result<()>;

    async fn send_to_property_inspector(&self, context: &str, payload: Value) -> anyhow::Result<()>;

    async fn open_url(&self, url: &str) -> anyhow::Result<()>;

    /// Sink that sets the key image for `context`
    fn frame_sink(&self, context: &str) -> Arc<dyn FrameSink>;
}

#[derive(Error, Debug)]
enum UpdateError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

struct ActionState {
    settings: ActionSettings,
    session: Arc<AccountAuthenticator>,
    last_poll: Option<Instant>,
}

pub struct BadgeAction {
    slot: SlotId,
    kind: ActionKind,
    plugin: Arc<PluginContext>,
    host: Arc<dyn PluginHost>,
    sink: Arc<dyn FrameSink>,
    glyph: Option<String>,
    state: Mutex<ActionState>,
}

impl BadgeAction {
    /// Build the action for a newly appeared key, register it for account
    /// removals and push its first badge.
    pub async fn create(
        context: &str,
        kind: ActionKind,
        payload: &Value,
        plugin: Arc<PluginContext>,
        host: Arc<dyn PluginHost>,
    ) -> Arc<Self> {
        let settings = ActionSettings::from_payload(kind, payload);
        let session = session_for(&plugin, &settings);

        let action = Arc::new(Self {
            slot: SlotId::new(context),
            kind,
            sink: host.frame_sink(context),
            glyph: plugin.glyph_for(kind),
            state: Mutex::new(ActionState {
                settings,
                session: session.clone(),
                last_poll: None,
            }),
            plugin,
            host,
        });

        let listener: Arc<dyn AccountListener> = action.clone();
        action.plugin.notifier().subscribe(listener);
        tracing::info!("{:?} action appeared on {}", kind, action.slot);

        if is_blank_payload(payload) {
            action.persist_settings().await;
        }

        session.initialize(InteractionPolicy::SilentOnly).await;
        action.send_accounts().await;
        action.update(true).await;
        action
    }

    pub fn context(&self) -> &str {
        self.slot.as_str()
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn settings(&self) -> ActionSettings {
        self.state().settings.clone()
    }

    pub fn session(&self) -> Arc<AccountAuthenticator> {
        self.state().session.clone()
    }

    /// Settings changed in the property inspector: start over with a new
    /// session. User initiated, so consent may be requested.
    pub async fn received_settings(&self, payload: &Value) {
        let settings = ActionSettings::from_payload(self.kind, payload);
        let session = session_for(&self.plugin, &settings);
        {
            let mut state = self.state();
            state.settings = settings;
            state.session = session.clone();
            state.last_poll = None;
        }

        session.initialize(InteractionPolicy::AllowInteractive).await;
        self.send_accounts().await;
        self.update(true).await;
    }

    /// Host timer tick; polls at most once per poll interval.
    pub async fn on_tick(&self) {
        self.update(false).await;
    }

    pub async fn key_pressed(&self) {
        let session = self.session();
        if !session.is_ready() {
            tracing::debug!("Key pressed on {} without a ready session", self.slot);
            return;
        }

        match self.outlook_url(&session).await {
            Ok(url) => {
                if let Err(err) = self.host.open_url(&url).await {
                    tracing::warn!("Failed to open {}: {:#}", url, err);
                }
            }
            Err(err) => tracing::warn!("Could not build Outlook link for {}: {}", self.slot, err),
        }

        self.update(true).await;
    }

    pub async fn property_inspector_appeared(&self) {
        self.send_accounts().await;
    }

    /// `{"operation": "add" | "remove"}` from the property inspector
    pub async fn inspector_message(&self, payload: &Value) {
        match payload.get("operation").and_then(Value::as_str) {
            Some("add") => self.add_account().await,
            Some("remove") => self.remove_selected_account().await,
            other => tracing::debug!("Ignoring inspector operation {:?} on {}", other, self.slot),
        }
    }

    /// Key removed from the deck
    pub fn dispose(self: &Arc<Self>) {
        let listener: Arc<dyn AccountListener> = self.clone();
        self.plugin.notifier().unsubscribe(&listener);
        self.plugin.scheduler().dispose(&self.slot);
        tracing::info!("{:?} action on {} disposed", self.kind, self.slot);
    }

    async fn add_account(&self) {
        let session = self.session();
        match session.start_new_account_flow().await {
            Ok(handle) => tracing::info!("Account {} added from {}", handle, self.slot),
            Err(err) => tracing::warn!("Adding an account from {} failed: {}", self.slot, err),
        }
        self.send_accounts().await;
    }

    async fn remove_selected_account(&self) {
        let session = self.session();
        let Some(handle) = session.account().cloned() else {
            return;
        };
        let app = session.application().clone();

        if let Err(err) = session.revoke_account(&handle).await {
            tracing::warn!("Revoking {} from {} failed: {}", handle, self.slot, err);
            return;
        }

        if self.forget_account(&handle) {
            self.persist_settings().await;
            self.send_accounts().await;
        }
        self.plugin.notifier().publish_account_removed(&app, &handle);
    }

    /// Clear `handle` if it is the bound account, swap in an unconfigured
    /// session and show the "not connected" badge. Returns whether anything
    /// changed.
    fn forget_account(&self, handle: &AccountHandle) -> bool {
        {
            let mut state = self.state();
            let bound = AccountHandle::from_settings(state.settings.account());
            if !bound.is_some_and(|bound| bound.matches(handle)) {
                return false;
            }
            state.settings.set_account("");
            state.session = session_for(&self.plugin, &state.settings);
            state.last_poll = None;
        }
        tracing::info!("Account {} cleared from {}", handle, self.slot);
        self.show(badge::not_connected_badge());
        true
    }

    async fn update(&self, force: bool) {
        let session = self.session();
        if !session.is_ready() {
            self.show(badge::not_connected_badge());
            return;
        }

        {
            let mut state = self.state();
            let interval = self.plugin.config().poll_interval();
            let due = state.last_poll.map_or(true, |last| last.elapsed() >= interval);
            if !force && !due {
                return;
            }
            state.last_poll = Some(Instant::now());
        }

        let outcome = self.poll(&session).await;
        if !self.is_current(&session) {
            tracing::debug!("Dropping poll result for {}: session was replaced", self.slot);
            return;
        }

        match outcome {
            Ok(request) => self.show(request),
            Err(err) => {
                tracing::warn!("Badge update for {} failed: {}", self.slot, err);
                self.show(badge::not_connected_badge());
            }
        }
    }

    fn is_current(&self, session: &Arc<AccountAuthenticator>) -> bool {
        Arc::ptr_eq(&self.state().session, session)
    }

    async fn poll(&self, session: &AccountAuthenticator) -> Result<AnimationRequest, UpdateError> {
        let token = session.acquire_access_token(InteractionPolicy::SilentOnly).await?;
        let graph = self.plugin.graph().as_ref();

        let request = match self.kind {
            ActionKind::Calendar => {
                let events = events_for_today_or_tomorrow(graph, &token, Utc::now()).await?;
                badge::calendar_badge(&events, Utc::now(), &chrono::Local)
            }
            ActionKind::Mail => badge::mail_badge(&graph.unread_mail(&token).await?),
        };
        Ok(request)
    }

    async fn outlook_url(&self, session: &AccountAuthenticator) -> Result<String, UpdateError> {
        match self.kind {
            ActionKind::Calendar => Ok(CALENDAR_URL.to_string()),
            ActionKind::Mail => {
                let token = session.acquire_access_token(InteractionPolicy::SilentOnly).await?;
                let inbox = self.plugin.graph().inbox_id(&token).await?;
                Ok(format!("{}/{}", MAIL_URL, inbox))
            }
        }
    }

    fn show(&self, request: AnimationRequest) {
        let request = request.with_glyph(self.glyph.clone());
        self.plugin.scheduler().submit(&self.slot, request, self.sink.clone());
    }

    async fn persist_settings(&self) {
        let payload = self.settings().to_payload();
        if let Err(err) = self.host.set_settings(self.context(), payload).await {
            tracing::warn!("Failed to save settings for {}: {:#}", self.slot, err);
        }
    }

    async fn send_accounts(&self) {
        let (app, account) = {
            let state = self.state();
            (
                ApplicationIdentity::new(state.settings.app_id()),
                AccountHandle::from_settings(state.settings.account()),
            )
        };
        let accounts = self.plugin.directory().list(&app).await;
        let payload = json!({
            "message": "accountsLoaded",
            "data": {
                "accounts": accounts,
                "currentAccount": account,
            },
        });

        if let Err(err) = self.host.send_to_property_inspector(self.context(), payload).await {
            tracing::warn!("Failed to send accounts to inspector for {}: {:#}", self.slot, err);
        }
    }

    fn state(&self) -> MutexGuard<'_, ActionState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl AccountListener for BadgeAction {
    fn application_id(&self) -> ApplicationIdentity {
        ApplicationIdentity::new(self.state().settings.app_id())
    }

    /// Another action revoked an account. Settings are saved in the
    /// background since listeners run synchronously.
    fn on_account_removed(&self, account: &AccountHandle) {
        if !self.forget_account(account) {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime to save settings for {}", self.slot);
            return;
        };
        let host = self.host.clone();
        let context = self.slot.as_str().to_string();
        let payload = self.settings().to_payload();
        runtime.spawn(async move {
            if let Err(err) = host.set_settings(&context, payload).await {
                tracing::warn!("Failed to save settings for {}: {:#}", context, err);
            }
        });
    }
}

fn session_for(plugin: &PluginContext, settings: &ActionSettings) -> Arc<AccountAuthenticator> {
    plugin.configure(settings.app_id(), Some(settings.account()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::animation::{Frame, SinkError, SvgBadgeRenderer};
    use crate::auth::testing::{grant_for, ScriptedProvider};
    use crate::config::PluginConfig;
    use crate::graph::testing::ScriptedGraph;
    use crate::graph::{CalendarEvent, MailSummary};
    use crate::storage::MemoryBackend;
    use std::collections::HashMap;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
    }

    impl FrameSink for RecordingSink {
        fn deliver(&self, frame: Frame) -> Result<(), SinkError> {
            self.frames.lock().unwrap().push(frame.into_inner());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        settings: Mutex<Vec<(String, Value)>>,
        inspector: Mutex<Vec<(String, Value)>>,
        urls: Mutex<Vec<String>>,
        sinks: Mutex<HashMap<String, Arc<RecordingSink>>>,
    }

    impl RecordingHost {
        fn sink(&self, context: &str) -> Arc<RecordingSink> {
            self.sinks
                .lock()
                .unwrap()
                .entry(context.to_string())
                .or_default()
                .clone()
        }

        fn last_frame(&self, context: &str) -> String {
            self.sink(context).frames.lock().unwrap().last().cloned().unwrap_or_default()
        }

        fn last_settings(&self, context: &str) -> Option<Value> {
            self.settings
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(ctx, _)| ctx == context)
                .map(|(_, value)| value.clone())
        }

        fn last_inspector(&self, context: &str) -> Option<Value> {
            self.inspector
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(ctx, _)| ctx == context)
                .map(|(_, value)| value.clone())
        }
    }

    #[async_trait]
    impl PluginHost for RecordingHost {
        async fn set_settings(&self, context: &str, settings: Value) -> anyhow::Result<()> {
            self.settings.lock().unwrap().push((context.to_string(), settings));
            Ok(())
        }

        async fn send_to_property_inspector(&self, context: &str, payload: Value) -> anyhow::Result<()> {
            self.inspector.lock().unwrap().push((context.to_string(), payload));
            Ok(())
        }

        async fn open_url(&self, url: &str) -> anyhow::Result<()> {
            self.urls.lock().unwrap().push(url.to_string());
            Ok(())
        }

        fn frame_sink(&self, context: &str) -> Arc<dyn FrameSink> {
            self.sink(context)
        }
    }

    struct Harness {
        plugin: Arc<PluginContext>,
        provider: Arc<ScriptedProvider>,
        graph: Arc<ScriptedGraph>,
        host: Arc<RecordingHost>,
    }

    impl Harness {
        fn new() -> Self {
            let provider = Arc::new(ScriptedProvider::new());
            let graph = Arc::new(ScriptedGraph::new());
            let mut config = PluginConfig::default();
            config.assets_dir = std::env::temp_dir().join("m365-deck-no-assets");
            let plugin = Arc::new(PluginContext::new(
                config,
                Arc::new(MemoryBackend::new()),
                provider.clone(),
                graph.clone(),
                Arc::new(SvgBadgeRenderer),
            ));
            Self {
                plugin,
                provider,
                graph,
                host: Arc::new(RecordingHost::default()),
            }
        }

        async fn seed(&self, app: &str, oid: &str, tid: &str) {
            self.provider
                .on_interactive(Ok(grant_for(oid, tid, "Ada Lovelace", "at-seed")));
            self.plugin
                .configure(app, None)
                .start_new_account_flow()
                .await
                .expect("seed account");
            self.provider.calls.lock().unwrap().clear();
        }

        async fn action(&self, context: &str, kind: ActionKind, payload: Value) -> Arc<BadgeAction> {
            let action =
                BadgeAction::create(context, kind, &payload, self.plugin.clone(), self.host.clone()).await;
            settle().await;
            action
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn mail_calls(graph: &ScriptedGraph) -> usize {
        graph.calls().iter().filter(|c| c.starts_with("mail:")).count()
    }

    #[tokio::test(start_paused = true)]
    async fn unconfigured_action_saves_defaults_and_shows_not_connected() {
        let h = Harness::new();

        let _action = h.action("ctx-1", ActionKind::Calendar, Value::Null).await;

        assert_eq!(h.host.last_settings("ctx-1"), Some(json!({"appId": "", "account": ""})));
        assert_eq!(
            h.host.last_inspector("ctx-1"),
            Some(json!({"message": "accountsLoaded", "data": {"accounts": {}, "currentAccount": null}}))
        );
        assert!(h.host.last_frame("ctx-1").contains(">Nope</text>"));
        assert!(h.provider.calls().is_empty());
        assert!(h.graph.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn configured_calendar_action_polls_and_throttles() {
        let h = Harness::new();
        h.seed("app-a", "oid", "tid").await;
        let now = Utc::now();
        h.graph.push_events(Ok(vec![
            CalendarEvent {
                subject: Some("Standup".to_string()),
                start: now + chrono::Duration::minutes(10),
                end: now + chrono::Duration::minutes(25),
            },
            CalendarEvent {
                subject: Some("Lunch".to_string()),
                start: now + chrono::Duration::minutes(90),
                end: now + chrono::Duration::minutes(150),
            },
        ]));

        let action = h
            .action("ctx-1", ActionKind::Calendar, json!({"appId": "app-a", "account": "oid.tid"}))
            .await;

        assert!(action.session().is_ready());
        assert_eq!(h.provider.calls(), vec!["validate:at-seed".to_string()]);
        let frame = h.host.last_frame("ctx-1");
        assert!(frame.contains(">2</text>"), "{}", frame);
        assert!(frame.contains("rgb(255,69,0)"));
        let inspector = h.host.last_inspector("ctx-1").unwrap();
        assert_eq!(inspector["data"]["accounts"]["oid.tid"], "Ada Lovelace");
        assert_eq!(inspector["data"]["currentAccount"], "oid.tid");

        let polls = h.graph.calls().len();
        action.on_tick().await;
        assert_eq!(h.graph.calls().len(), polls);

        tokio::time::sleep(Duration::from_secs(121)).await;
        action.on_tick().await;
        assert!(h.graph.calls().len() > polls);
    }

    #[tokio::test(start_paused = true)]
    async fn mail_key_press_opens_inbox_and_forces_update() {
        let h = Harness::new();
        h.seed("app-a", "oid", "tid").await;
        h.graph.set_mail(Ok(MailSummary {
            unread: 4,
            latest_subject: Some("Invoice".to_string()),
        }));

        let action = h
            .action("ctx-m", ActionKind::Mail, json!({"appId": "app-a", "account": "oid.tid"}))
            .await;
        assert_eq!(mail_calls(&h.graph), 1);
        assert!(h.host.last_frame("ctx-m").contains(">4</text>"));

        action.key_pressed().await;

        assert_eq!(*h.host.urls.lock().unwrap(), vec!["https://outlook.live.com/mail/inbox-id".to_string()]);
        assert_eq!(mail_calls(&h.graph), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn key_press_without_session_does_nothing() {
        let h = Harness::new();
        let action = h.action("ctx-1", ActionKind::Calendar, json!({"appId": "app-a"})).await;

        action.key_pressed().await;

        assert!(h.host.urls.lock().unwrap().is_empty());
        assert!(h.graph.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn graph_failure_shows_not_connected_but_keeps_session() {
        let h = Harness::new();
        h.seed("app-a", "oid", "tid").await;
        h.graph.set_mail(Err(GraphError::Http(503)));

        let action = h
            .action("ctx-m", ActionKind::Mail, json!({"appId": "app-a", "account": "oid.tid"}))
            .await;

        assert!(h.host.last_frame("ctx-m").contains(">Nope</text>"));
        assert!(action.session().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn removing_account_fans_out_to_actions_on_same_identity() {
        let h = Harness::new();
        h.seed("app-a", "oid", "tid").await;
        h.seed("app-b", "oid", "tid").await;
        let bound = json!({"appId": "app-a", "account": "oid.tid"});

        let remover = h.action("ctx-1", ActionKind::Mail, bound.clone()).await;
        let sibling = h
            .action("ctx-2", ActionKind::Calendar, json!({"appId": "APP-A", "account": "OID.TID"}))
            .await;
        let bystander = h
            .action("ctx-3", ActionKind::Mail, json!({"appId": "app-b", "account": "oid.tid"}))
            .await;
        assert!(sibling.session().is_ready());

        remover.inspector_message(&json!({"operation": "remove"})).await;
        settle().await;

        assert_eq!(remover.settings().account(), "");
        assert_eq!(sibling.settings().account(), "");
        assert_eq!(bystander.settings().account(), "oid.tid");
        assert!(!sibling.session().is_ready());
        assert!(bystander.session().is_ready());
        assert_eq!(h.host.last_settings("ctx-1"), Some(json!({"appId": "app-a", "account": ""})));
        assert_eq!(h.host.last_settings("ctx-2"), Some(json!({"appId": "APP-A", "account": ""})));
        assert!(h.host.last_frame("ctx-2").contains(">Nope</text>"));
        assert!(h
            .plugin
            .directory()
            .list(&ApplicationIdentity::new("app-a"))
            .await
            .is_empty());
        assert_eq!(h.plugin.directory().list(&ApplicationIdentity::new("app-b")).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn removal_during_slow_poll_keeps_not_connected_badge() {
        let h = Harness::new();
        h.seed("app-a", "oid", "tid").await;
        h.graph.set_mail(Ok(MailSummary {
            unread: 4,
            latest_subject: None,
        }));
        let bound = json!({"appId": "app-a", "account": "oid.tid"});
        let remover = h.action("ctx-1", ActionKind::Mail, bound.clone()).await;
        let sibling = h.action("ctx-2", ActionKind::Mail, bound).await;
        assert!(h.host.last_frame("ctx-2").contains(">4</text>"));

        h.graph.delay_mail(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(121)).await;
        let remove = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            remover.inspector_message(&json!({"operation": "remove"})).await;
        };
        tokio::join!(sibling.on_tick(), remove);
        settle().await;

        assert_eq!(mail_calls(&h.graph), 3);
        assert!(!sibling.session().is_ready());
        let frame = h.host.last_frame("ctx-2");
        assert!(frame.contains(">Nope</text>"), "{}", frame);
        assert!(!frame.contains(">4</text>"));
    }

    #[tokio::test(start_paused = true)]
    async fn add_operation_runs_consent_flow_and_republishes_accounts() {
        let h = Harness::new();
        let action = h.action("ctx-1", ActionKind::Calendar, json!({"appId": "app-a"})).await;
        h.provider
            .on_interactive(Ok(grant_for("new", "tid", "Grace Hopper", "grace-at")));

        action.inspector_message(&json!({"operation": "add"})).await;

        assert_eq!(h.provider.calls(), vec!["interactive:app-a:-".to_string()]);
        let inspector = h.host.last_inspector("ctx-1").unwrap();
        assert_eq!(inspector["data"]["accounts"]["new.tid"], "Grace Hopper");
        assert_eq!(action.settings().account(), "");
    }

    #[tokio::test(start_paused = true)]
    async fn received_settings_replace_session_and_may_prompt() {
        let h = Harness::new();
        let action = h.action("ctx-1", ActionKind::Mail, json!({"appId": "app-a"})).await;
        let first = action.session();
        h.provider
            .on_interactive(Ok(grant_for("oid", "tid", "Ada Lovelace", "prompt-at")));

        action
            .received_settings(&json!({"appId": "app-a", "account": "oid.tid"}))
            .await;
        settle().await;

        assert!(!Arc::ptr_eq(&first, &action.session()));
        assert!(action.session().is_ready());
        assert!(h.provider.calls().contains(&"interactive:app-a:-".to_string()));
        assert_eq!(mail_calls(&h.graph), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_action_stops_listening_and_drawing() {
        let h = Harness::new();
        let action = h.action("ctx-1", ActionKind::Calendar, json!({"appId": "app-a"})).await;
        assert_eq!(h.plugin.notifier().listener_count(), 1);

        action.dispose();
        let frames = h.sink_len("ctx-1");
        action.on_tick().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(h.plugin.notifier().listener_count(), 0);
        assert_eq!(h.sink_len("ctx-1"), frames);
        assert!(!h.plugin.scheduler().is_running(&SlotId::from("ctx-1")));
    }

    impl Harness {
        fn sink_len(&self, context: &str) -> usize {
            self.host.sink(context).frames.lock().unwrap().len()
        }
    }
}
