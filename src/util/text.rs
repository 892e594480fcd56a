use std::borrow::Cow;

/// Removes control characters from feed-supplied text.
///
/// Tabs, newlines and carriage returns survive; other C0 controls, DEL and
/// the C1 range are dropped. ESC goes too, which neutralizes terminal
/// escape sequences when titles are printed by the CLI.
///
/// Returns `Cow::Borrowed` when nothing needs stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|c| !is_stripped(*c)).collect())
}

fn is_stripped(c: char) -> bool {
    match c {
        '\t' | '\n' | '\r' => false,
        c => c.is_control(),
    }
}

/// Collapses runs of whitespace (including newlines) into single spaces and
/// trims the ends. Feed titles frequently carry indentation from the XML.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sanitizes a single-line label such as a feed or article title.
///
/// Returns `None` when nothing printable is left, so callers can apply
/// their own "Untitled" default.
pub fn clean_label(s: &str) -> Option<String> {
    let cleaned = collapse_whitespace(&strip_control_chars(s));
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}
