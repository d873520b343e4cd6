//! Text helpers shared by the output collector and the result serializer.
//!
//! Everything here operates on UTF-8 `str` data and never splits a character:
//! truncation always lands on a char boundary at or below the requested size.
//!
//! # Examples
//!
//! ```
//! use scriptbox::utils::text::{describe_deadline, truncate_on_char_boundary};
//! use std::time::Duration;
//!
//! assert_eq!(truncate_on_char_boundary("héllo", 2), "h");
//! assert_eq!(describe_deadline(Duration::from_secs(5)), "5 seconds");
//! ```

use std::time::Duration;

/// Returns the longest prefix of `text` that fits in `max_bytes` without
/// splitting a UTF-8 character.
///
/// # Arguments
///
/// * `text` - The string to cut
/// * `max_bytes` - Upper bound on the returned prefix length in bytes
///
/// # Examples
///
/// ```
/// use scriptbox::utils::text::truncate_on_char_boundary;
///
/// assert_eq!(truncate_on_char_boundary("abcdef", 3), "abc");
/// assert_eq!(truncate_on_char_boundary("abc", 10), "abc");
/// ```
pub fn truncate_on_char_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }

    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Renders a deadline the way it appears in timeout messages.
///
/// Whole seconds are spelled out (`"5 seconds"`, `"1 second"`); anything else
/// falls back to milliseconds (`"250 ms"`, `"1500 ms"`).
pub fn describe_deadline(deadline: Duration) -> String {
    let millis = deadline.as_millis();
    if millis > 0 && millis % 1000 == 0 {
        let secs = millis / 1000;
        if secs == 1 {
            "1 second".to_string()
        } else {
            format!("{} seconds", secs)
        }
    } else {
        format!("{} ms", millis)
    }
}

/// Returns a short, log-friendly preview of untrusted source text.
///
/// Newlines are flattened so one script never spans several log lines.
pub fn source_preview(source: &str, max_bytes: usize) -> String {
    let head = truncate_on_char_boundary(source, max_bytes);
    let flattened = head.replace(['\n', '\r'], " ");
    if head.len() < source.len() {
        format!("{}...", flattened)
    } else {
        flattened
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_ascii() {
        assert_eq!(truncate_on_char_boundary("hello world", 5), "hello");
        assert_eq!(truncate_on_char_boundary("hello", 0), "");
    }

    #[test]
    fn test_truncate_never_splits_multibyte() {
        // 'é' is two bytes; cutting at 2 would land inside it
        assert_eq!(truncate_on_char_boundary("héllo", 2), "h");
        assert_eq!(truncate_on_char_boundary("héllo", 3), "hé");
        assert_eq!(truncate_on_char_boundary("🦀🦀", 5), "🦀");
    }

    #[test]
    fn test_truncate_short_input_untouched() {
        assert_eq!(truncate_on_char_boundary("abc", 3), "abc");
        assert_eq!(truncate_on_char_boundary("", 8), "");
    }

    #[test]
    fn test_describe_deadline_seconds() {
        assert_eq!(describe_deadline(Duration::from_secs(5)), "5 seconds");
        assert_eq!(describe_deadline(Duration::from_secs(1)), "1 second");
        assert_eq!(describe_deadline(Duration::from_secs(30)), "30 seconds");
    }

    #[test]
    fn test_describe_deadline_millis() {
        assert_eq!(describe_deadline(Duration::from_millis(250)), "250 ms");
        assert_eq!(describe_deadline(Duration::from_millis(1500)), "1500 ms");
        assert_eq!(describe_deadline(Duration::ZERO), "0 ms");
    }

    #[test]
    fn test_source_preview() {
        assert_eq!(source_preview("a\nb", 10), "a b");
        assert_eq!(source_preview("abcdef", 3), "abc...");
    }
}
