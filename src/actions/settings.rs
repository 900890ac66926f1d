//! Per-action settings as persisted by the host

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Calendar,
    Mail,
}

impl ActionKind {
    pub fn all() -> [ActionKind; 2] {
        [ActionKind::Calendar, ActionKind::Mail]
    }

    /// Action identifier registered in the plugin manifest
    pub fn action_uuid(self) -> &'static str {
        match self {
            ActionKind::Calendar => "es.mspi.microsoft.calendar",
            ActionKind::Mail => "es.mspi.microsoft.mail",
        }
    }

    pub fn from_action_uuid(uuid: &str) -> Option<Self> {
        Self::all().into_iter().find(|kind| kind.action_uuid() == uuid)
    }

    pub fn glyph_file(self) -> &'static str {
        match self {
            ActionKind::Calendar => "calendar.png",
            ActionKind::Mail => "mail.png",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalendarSettings {
    pub app_id: String,
    pub account: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailSettings {
    pub app_id: String,
    pub account: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionSettings {
    Calendar(CalendarSettings),
    Mail(MailSettings),
}

pub fn default_settings_for(kind: ActionKind) -> ActionSettings {
    match kind {
        ActionKind::Calendar => ActionSettings::Calendar(CalendarSettings::default()),
        ActionKind::Mail => ActionSettings::Mail(MailSettings::default()),
    }
}

impl ActionSettings {
    /// Parse the host's settings object. A missing or unreadable object
    /// yields the defaults for `kind`.
    pub fn from_payload(kind: ActionKind, payload: &Value) -> Self {
        if is_blank_payload(payload) {
            return default_settings_for(kind);
        }

        let parsed = match kind {
            ActionKind::Calendar => {
                serde_json::from_value::<CalendarSettings>(payload.clone()).map(ActionSettings::Calendar)
            }
            ActionKind::Mail => serde_json::from_value::<MailSettings>(payload.clone()).map(ActionSettings::Mail),
        };
        parsed.unwrap_or_else(|err| {
            tracing::warn!("Unreadable {:?} settings, using defaults: {}", kind, err);
            default_settings_for(kind)
        })
    }

    pub fn to_payload(&self) -> Value {
        let value = match self {
            ActionSettings::Calendar(settings) => serde_json::to_value(settings),
            ActionSettings::Mail(settings) => serde_json::to_value(settings),
        };
        value.unwrap_or(Value::Null)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            ActionSettings::Calendar(_) => ActionKind::Calendar,
            ActionSettings::Mail(_) => ActionKind::Mail,
        }
    }

    pub fn app_id(&self) -> &str {
        match self {
            ActionSettings::Calendar(settings) => &settings.app_id,
            ActionSettings::Mail(settings) => &settings.app_id,
        }
    }

    pub fn account(&self) -> &str {
        match self {
            ActionSettings::Calendar(settings) => &settings.account,
            ActionSettings::Mail(settings) => &settings.account,
        }
    }

    pub fn set_account(&mut self, account: impl Into<String>) {
        let account = account.into();
        match self {
            ActionSettings::Calendar(settings) => settings.account = account,
            ActionSettings::Mail(settings) => settings.account = account,
        }
    }
}

/// `null` or `{}`: the host has never stored settings for this action.
pub fn is_blank_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_empty_per_kind() {
        assert_eq!(
            default_settings_for(ActionKind::Calendar),
            ActionSettings::Calendar(CalendarSettings::default())
        );
        let mail = default_settings_for(ActionKind::Mail);
        assert_eq!(mail.kind(), ActionKind::Mail);
        assert_eq!(mail.app_id(), "");
        assert_eq!(mail.to_payload(), json!({"appId": "", "account": ""}));
    }

    #[test]
    fn payload_uses_host_field_names() {
        let settings = ActionSettings::from_payload(
            ActionKind::Calendar,
            &json!({"appId": "db75ff81", "account": "oid.tid", "extra": true}),
        );
        assert_eq!(settings.app_id(), "db75ff81");
        assert_eq!(settings.account(), "oid.tid");
    }

    #[test]
    fn blank_or_garbled_payload_falls_back_to_defaults() {
        assert_eq!(ActionSettings::from_payload(ActionKind::Mail, &json!({})), default_settings_for(ActionKind::Mail));
        assert_eq!(ActionSettings::from_payload(ActionKind::Mail, &Value::Null), default_settings_for(ActionKind::Mail));
        assert_eq!(
            ActionSettings::from_payload(ActionKind::Mail, &json!({"appId": 42})),
            default_settings_for(ActionKind::Mail)
        );
    }

    #[test]
    fn partial_payload_keeps_missing_fields_empty() {
        let settings = ActionSettings::from_payload(ActionKind::Mail, &json!({"appId": "app"}));
        assert_eq!(settings.account(), "");
    }

    #[test]
    fn set_account_only_touches_account() {
        let mut settings = ActionSettings::from_payload(ActionKind::Calendar, &json!({"appId": "app", "account": "a.t"}));
        settings.set_account("");
        assert_eq!(settings.to_payload(), json!({"appId": "app", "account": ""}));
    }

    #[test]
    fn action_uuids_round_trip_to_kinds() {
        assert_eq!(ActionKind::from_action_uuid("es.mspi.microsoft.mail"), Some(ActionKind::Mail));
        assert_eq!(ActionKind::from_action_uuid("es.mspi.microsoft.unknown"), None);
    }
}
