//! Badge decisions: polled Graph data in, [`AnimationRequest`] out.
//!
//! Pure functions, no I/O and no clock reads; callers pass `now`.

use std::fmt::Display;

use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::animation::{AnimationRequest, Color, Headline};
use crate::graph::{CalendarEvent, MailSummary};

const URGENT_MINUTES: i64 = 3;
const WARNING_MINUTES: i64 = 15;
const NOT_CONNECTED_TEXT: &str = "Nope";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tier {
    Urgent,
    Warning,
    Neutral,
    Informational,
}

impl Tier {
    pub fn color(self) -> Color {
        match self {
            Tier::Urgent => Color::RED,
            Tier::Warning => Color::ORANGE_RED,
            Tier::Neutral => Color::LIGHT_GRAY,
            Tier::Informational => Color::YELLOW,
        }
    }
}

/// First matching rule wins; the rules overlap on purpose.
///
/// Note the boundaries differ: a current event counts while it has been
/// running for strictly less than 3 minutes, a next event from 3 minutes
/// inclusive.
pub fn background_tier(next_starts_in: Option<Duration>, current_running_for: Option<Duration>) -> Tier {
    if current_running_for.is_some_and(|d| d < Duration::minutes(URGENT_MINUTES)) {
        return Tier::Urgent;
    }
    if next_starts_in.is_some_and(|d| d <= Duration::minutes(URGENT_MINUTES)) {
        return Tier::Urgent;
    }
    if next_starts_in.is_some_and(|d| d <= Duration::minutes(WARNING_MINUTES)) {
        return Tier::Warning;
    }
    if current_running_for.is_none() && next_starts_in.is_none() {
        return Tier::Neutral;
    }
    Tier::Informational
}

pub fn mail_tier(unread: u32) -> Tier {
    if unread == 0 {
        Tier::Neutral
    } else {
        Tier::Informational
    }
}

/// Calendar badge for the events of one query window.
///
/// The header shows the next event's start in `tz` as `HH:MM`.
pub fn calendar_badge<Tz>(events: &[CalendarEvent], now: DateTime<Utc>, tz: &Tz) -> AnimationRequest
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut sorted: Vec<&CalendarEvent> = events.iter().collect();
    sorted.sort_by_key(|event| event.start);

    let current = sorted.iter().find(|event| event.start < now && now < event.end);
    let next = sorted.iter().find(|event| event.start > now);

    let tier = background_tier(
        next.map(|event| event.start - now),
        current.map(|event| now - event.start),
    );

    let count = u32::try_from(events.len()).unwrap_or(u32::MAX);
    AnimationRequest::new(Headline::Count(count), tier.color())
        .with_header(next.map(|event| event.start.with_timezone(tz).format("%H:%M").to_string()))
        .with_footer(next.and_then(|event| event.subject.clone()))
}

pub fn mail_badge(summary: &MailSummary) -> AnimationRequest {
    AnimationRequest::new(Headline::Count(summary.unread), mail_tier(summary.unread).color())
        .with_footer(summary.latest_subject.clone())
}

/// Shown whenever the session is unready or a poll failed
pub fn not_connected_badge() -> AnimationRequest {
    AnimationRequest::new(Headline::Text(NOT_CONNECTED_TEXT.to_string()), Tier::Neutral.color())
}
