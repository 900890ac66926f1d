//! reqwest-backed Graph client
//!
//! Endpoints:
//! - /me/calendarView - Event occurrences in a time range (UTC)
//! - /me/mailFolders/Inbox - Unread count and folder id
//! - /me/mailFolders/Inbox/messages - Newest unread subject

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use url::Url;

use super::{CalendarEvent, GraphApi, GraphError, MailSummary};
use crate::auth::AccessToken;
use crate::config::PluginConfig;

const MAX_CALENDAR_PAGES: usize = 5;

pub struct GraphClient {
    client: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new(config: &PluginConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.graph_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, GraphError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|e| GraphError::Request(format!("Invalid Graph URL: {}", e)))
    }

    fn calendar_view_url(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Url, GraphError> {
        let mut url = self.endpoint("/me/calendarView")?;
        url.query_pairs_mut()
            .append_pair("startDateTime", &from.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("endDateTime", &to.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("$select", "subject,start,end")
            .append_pair("$orderby", "start/dateTime")
            .append_pair("$top", "50");
        Ok(url)
    }

    fn newest_unread_url(&self) -> Result<Url, GraphError> {
        let mut url = self.endpoint("/me/mailFolders/Inbox/messages")?;
        // Graph only accepts $orderby together with $filter when the ordered
        // property leads the filter.
        url.query_pairs_mut()
            .append_pair("$filter", "receivedDateTime ge 1900-01-01T00:00:00Z and isRead eq false")
            .append_pair("$orderby", "receivedDateTime desc")
            .append_pair("$select", "subject")
            .append_pair("$top", "1");
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, token: &AccessToken, url: Url) -> Result<T, GraphError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(token.secret())
            .header("Accept", "application/json")
            .header("Prefer", r#"outlook.timezone="UTC""#)
            .send()
            .await
            .map_err(|e| GraphError::Request(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GraphError::Unauthorized);
        }
        if !status.is_success() {
            return Err(GraphError::Http(status.as_u16()));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| GraphError::Decode(e.to_string()))
    }

    async fn inbox(&self, token: &AccessToken) -> Result<MailFolderResponse, GraphError> {
        let mut url = self.endpoint("/me/mailFolders/Inbox")?;
        url.query_pairs_mut().append_pair("$select", "id,unreadItemCount");
        self.get_json(token, url).await
    }
}

#[async_trait]
impl GraphApi for GraphClient {
    async fn calendar_view(
        &self,
        token: &AccessToken,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, GraphError> {
        let mut events = Vec::new();
        let mut next = Some(self.calendar_view_url(from, to)?);
        let mut pages = 0;

        while let Some(url) = next.take() {
            let page: CalendarViewResponse = self.get_json(token, url).await?;
            for raw in page.value {
                events.push(raw.into_event()?);
            }

            pages += 1;
            next = next_calendar_page(page.next_link, pages)?;
        }

        tracing::debug!("Calendar view returned {} event(s)", events.len());
        Ok(events)
    }

    async fn unread_mail(&self, token: &AccessToken) -> Result<MailSummary, GraphError> {
        let folder = self.inbox(token).await?;
        let unread = folder.unread_item_count.unwrap_or(0);

        let latest_subject = if unread > 0 {
            let page: MessagesResponse = self.get_json(token, self.newest_unread_url()?).await?;
            page.value.into_iter().next().and_then(|message| message.subject)
        } else {
            None
        };

        Ok(MailSummary {
            unread,
            latest_subject,
        })
    }

    async fn inbox_id(&self, token: &AccessToken) -> Result<String, GraphError> {
        let folder = self.inbox(token).await?;
        Ok(folder.id)
    }
}

/// Graph `dateTimeTimeZone` values carry no offset; with the UTC preference
/// header they are UTC wall-clock times with up to 7 fractional digits.
fn parse_graph_datetime(value: &str) -> Result<DateTime<Utc>, GraphError> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)))
        .map_err(|e| GraphError::Decode(format!("Bad event time '{}': {}", value, e)))
}

// ============== Response Types ==============

#[derive(Debug, Deserialize)]
struct CalendarViewResponse {
    #[serde(default)]
    value: Vec<RawEvent>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    subject: Option<String>,
    start: GraphDateTime,
    end: GraphDateTime,
}

impl RawEvent {
    fn into_event(self) -> Result<CalendarEvent, GraphError> {
        Ok(CalendarEvent {
            subject: self.subject,
            start: parse_graph_datetime(&self.start.date_time)?,
            end: parse_graph_datetime(&self.end.date_time)?,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphDateTime {
    date_time: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailFolderResponse {
    id: String,
    unread_item_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    value: Vec<MessageSummary>,
}

#[derive(Debug, Deserialize)]
struct MessageSummary {
    subject: Option<String>,
}

/// Url of the next calendarView page. Paging stops at the page cap with a
/// warning since the badge count is short from then on.
fn next_calendar_page(next_link: Option<String>, pages_read: usize) -> Result<Option<Url>, GraphError> {
    let Some(link) = next_link else {
        return Ok(None);
    };
    if pages_read >= MAX_CALENDAR_PAGES {
        tracing::warn!(
            "Calendar view has more than {} pages; event count is truncated",
            pages_read
        );
        return Ok(None);
    }
    Url::parse(&link)
        .map(Some)
        .map_err(|e| GraphError::Decode(format!("Bad nextLink: {}", e)))
}
