//! Badge rendering and the per-slot animation loop
//!
//! A badge is described once as an [`AnimationRequest`]; the
//! [`BadgeScheduler`] turns it into a repeating sequence of frames (footer
//! ticker, then static holds) and pushes them to the host through a
//! [`FrameSink`].

mod render;
mod scheduler;
mod scroll;

pub use render::{glyph_data_uri, Renderer, SvgBadgeRenderer};
pub use scheduler::{AnimationHandle, BadgeScheduler, SlotId};
pub use scroll::{grapheme_len, scroll_windows};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Color(pub [u8; 4]);

impl Color {
    pub const RED: Color = Color([255, 0, 0, 255]);
    pub const ORANGE_RED: Color = Color([255, 69, 0, 255]);
    pub const LIGHT_GRAY: Color = Color([211, 211, 211, 255]);
    pub const YELLOW: Color = Color([255, 255, 0, 255]);
    pub const BLUE: Color = Color([0, 0, 255, 255]);

    /// CSS `rgb()` form; keeps `#` out of data URIs.
    pub fn css(&self) -> String {
        let [r, g, b, _] = self.0;
        format!("rgb({},{},{})", r, g, b)
    }
}

/// Big centered text of the badge
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Headline {
    Count(u32),
    Text(String),
}

impl std::fmt::Display for Headline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Headline::Count(count) => write!(f, "{}", count),
            Headline::Text(text) => f.write_str(text),
        }
    }
}

/// Everything needed to draw one badge. Immutable once submitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnimationRequest {
    pub headline: Headline,
    pub foreground: Color,
    pub background: Color,
    pub header: Option<String>,
    pub footer: Option<String>,
    /// Image href (usually a `data:` URI) drawn in the top-right corner
    pub glyph: Option<String>,
}

impl AnimationRequest {
    pub fn new(headline: Headline, background: Color) -> Self {
        Self {
            headline,
            foreground: Color::BLUE,
            background,
            header: None,
            footer: None,
            glyph: None,
        }
    }

    pub fn with_header(mut self, header: Option<String>) -> Self {
        self.header = non_blank(header);
        self
    }

    /// Blank footers are dropped so the loop renders a footer-less frame
    /// instead of an empty line.
    pub fn with_footer(mut self, footer: Option<String>) -> Self {
        self.footer = non_blank(footer);
        self
    }

    pub fn with_glyph(mut self, glyph: Option<String>) -> Self {
        self.glyph = glyph;
        self
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// One frame's view of a request: the request plus the footer text visible
/// in this frame.
#[derive(Debug, Clone, Copy)]
pub struct BadgeState<'a> {
    pub request: &'a AnimationRequest,
    pub footer: Option<&'a str>,
}

/// A rendered image as the host expects it (a data URI)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame(String);

impl Frame {
    pub fn new(image: impl Into<String>) -> Self {
        Self(image.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("Host rejected frame: {0}")]
    Rejected(String),
    #[error("Host connection closed")]
    Closed,
}

/// Where frames for one badge slot go. Called with the slot's delivery
/// gate held, so implementations must not block for long.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: Frame) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnimationTiming {
    pub scroll_step_ms: u64,
    pub static_hold_ms: u64,
    pub rest_hold_ms: u64,
    pub visible_footer_chars: usize,
}

impl Default for AnimationTiming {
    fn default() -> Self {
        Self {
            scroll_step_ms: 200,
            static_hold_ms: 1000,
            rest_hold_ms: 5000,
            visible_footer_chars: 10,
        }
    }
}

impl AnimationTiming {
    pub fn scroll_step(&self) -> Duration {
        Duration::from_millis(self.scroll_step_ms)
    }

    pub fn static_hold(&self) -> Duration {
        Duration::from_millis(self.static_hold_ms)
    }

    pub fn rest_hold(&self) -> Duration {
        Duration::from_millis(self.rest_hold_ms)
    }
}
