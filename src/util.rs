/// Truncate to at most `max_chars` characters, appending "..." when cut.
/// Counts chars, not bytes, so multibyte text never splits mid-codepoint.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
