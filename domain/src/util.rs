//! Shared utility functions.

/// One-line preview of user text for log lines.
///
/// Collapses whitespace runs (including newlines) to a single space and cuts
/// at `max_bytes` on a UTF-8 boundary, appending `…` when something was cut.
pub fn preview(text: &str, max_bytes: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.len() <= max_bytes {
        return flat;
    }
    let mut end = max_bytes;
    while end > 0 && !flat.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &flat[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_short_text_unchanged() {
        assert_eq!(preview("hello", 10), "hello");
    }

    #[test]
    fn preview_flattens_newlines() {
        assert_eq!(preview("hello\n  world", 40), "hello world");
    }

    #[test]
    fn preview_cuts_ascii() {
        assert_eq!(preview("hello world", 5), "hello…");
    }

    #[test]
    fn preview_multibyte_boundary() {
        // 'の' is 3 bytes; cutting at 4 backs up to the end of 'あ'
        assert_eq!(preview("あのね", 4), "あ…");
    }

    #[test]
    fn preview_empty() {
        assert_eq!(preview("", 10), "");
    }
}
