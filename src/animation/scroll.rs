use unicode_segmentation::UnicodeSegmentation;

/// Length in user-perceived characters
pub fn grapheme_len(text: &str) -> usize {
    text.graphemes(true).count()
}

/// Ticker windows for a footer wider than `visible` characters.
///
/// Each window starts one grapheme further right; the last one is aligned
/// to the tail so the text never scrolls off completely. Footers that fit
/// (or a zero-width slot) produce no windows.
pub fn scroll_windows(footer: &str, visible: usize) -> Vec<String> {
    let graphemes: Vec<&str> = footer.graphemes(true).collect();
    if visible == 0 || graphemes.len() <= visible {
        return Vec::new();
    }

    (0..=graphemes.len() - visible)
        .map(|offset| graphemes[offset..offset + visible].concat())
        .collect()
}
