use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;

use super::{BadgeState, Frame};

const ICON_SIZE: u32 = 72;
const HEADLINE_FONT_SIZE: u32 = 25;
const HEADER_FONT_SIZE: u32 = 15;
const FOOTER_FONT_SIZE: u32 = 13;
const GLYPH_SIZE: u32 = 25;

/// Pure function from badge state to an image the host can display
pub trait Renderer: Send + Sync {
    fn render(&self, state: &BadgeState<'_>) -> Frame;
}

/// 72x72 SVG badge as a `data:image/svg+xml` URI
#[derive(Debug, Default, Clone, Copy)]
pub struct SvgBadgeRenderer;

impl Renderer for SvgBadgeRenderer {
    fn render(&self, state: &BadgeState<'_>) -> Frame {
        let request = state.request;
        let mut svg = String::with_capacity(512);

        let _ = write!(
            svg,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{size}" height="{size}" viewBox="0 0 {size} {size}">"#,
            size = ICON_SIZE
        );
        let _ = write!(
            svg,
            r#"<rect x="0" y="0" width="{size}" height="{size}" fill="{fill}"/>"#,
            size = ICON_SIZE,
            fill = request.background.css()
        );
        let _ = write!(
            svg,
            r#"<text x="36" y="48.5" font-size="{}" font-weight="bold" text-anchor="middle" fill="{}">{}</text>"#,
            HEADLINE_FONT_SIZE,
            request.foreground.css(),
            escape_xml(&request.headline.to_string())
        );

        if let Some(header) = request.header.as_deref() {
            let _ = write!(
                svg,
                r#"<text x="2" y="15" font-size="{}" text-anchor="start" fill="{}">{}</text>"#,
                HEADER_FONT_SIZE,
                request.foreground.css(),
                escape_xml(header)
            );
        }

        if let Some(footer) = state.footer {
            let _ = write!(
                svg,
                r#"<text x="36" y="68" font-size="{}" text-anchor="middle" fill="{}">{}</text>"#,
                FOOTER_FONT_SIZE,
                request.foreground.css(),
                escape_xml(footer)
            );
        }

        if let Some(glyph) = request.glyph.as_deref() {
            let _ = write!(
                svg,
                r#"<image x="46" y="1" width="{size}" height="{size}" href="{}"/>"#,
                escape_xml(glyph),
                size = GLYPH_SIZE
            );
        }

        svg.push_str("</svg>");
        Frame::new(format!("data:image/svg+xml;charset=utf8,{}", svg))
    }
}

/// Load a PNG glyph as an inline `data:` URI
pub fn glyph_data_uri(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read glyph {:?}", path))?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}
