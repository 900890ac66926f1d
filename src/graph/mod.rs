//! Microsoft Graph data queries used by the badges
//!
//! All reads are idempotent; a failed poll is simply retried on the next
//! tick.

mod client;

pub use client::GraphClient;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::auth::AccessToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Graph rejected the access token")]
    Unauthorized,
    #[error("Graph returned status: {0}")]
    Http(u16),
    #[error("Graph request failed: {0}")]
    Request(String),
    #[error("Unexpected Graph response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEvent {
    pub subject: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailSummary {
    pub unread: u32,
    /// Subject of the newest unread message in the inbox
    pub latest_subject: Option<String>,
}

#[async_trait]
pub trait GraphApi: Send + Sync {
    /// Event occurrences overlapping `[from, to)`
    async fn calendar_view(
        &self,
        token: &AccessToken,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, GraphError>;

    async fn unread_mail(&self, token: &AccessToken) -> Result<MailSummary, GraphError>;

    /// Folder id of the well-known Inbox, used for the Outlook web link
    async fn inbox_id(&self, token: &AccessToken) -> Result<String, GraphError>;
}

/// Events from now until the end of the (UTC) day, or tomorrow's events
/// when today has nothing left.
pub async fn events_for_today_or_tomorrow(
    api: &dyn GraphApi,
    token: &AccessToken,
    now: DateTime<Utc>,
) -> Result<Vec<CalendarEvent>, GraphError> {
    let start_of_tomorrow = (now.date_naive() + Duration::days(1))
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
        .unwrap_or(now + Duration::days(1));

    let today = api.calendar_view(token, now, start_of_tomorrow).await?;
    if !today.is_empty() {
        return Ok(today);
    }

    tracing::debug!("No events left today, looking at tomorrow");
    api.calendar_view(token, start_of_tomorrow, start_of_tomorrow + Duration::days(1))
        .await
}
