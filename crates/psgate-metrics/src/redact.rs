use std::sync::LazyLock;

use regex::Regex;

static SECRET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(apikey|password|secret)=\S*").expect("secret regex"));

/// Replace `apiKey=`, `password=`, and `secret=` assignments with a
/// redaction marker.
pub fn redact_secrets(text: &str) -> String {
    SECRET.replace_all(text, "[REDACTED]").into_owned()
}

/// First `max` bytes of a string, cut on a UTF-8 character boundary.
pub fn preview(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Preview bytes with secrets redacted, as published on events.
pub fn event_preview(text: &str, max: usize) -> String {
    redact_secrets(preview(text, max))
}
