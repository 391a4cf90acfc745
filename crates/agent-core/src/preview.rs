/// Visible characters kept when previewing a tool result.
pub const PREVIEW_CHARS: usize = 50;

const ELLIPSIS: &str = "...";

/// Collapse every whitespace run (including newlines) to one space.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One-line preview of a tool result for the trace output.
pub fn preview(text: &str) -> String {
    preview_with_limit(text, PREVIEW_CHARS)
}

/// Counts characters, not bytes, so multi-byte text is never split.
pub fn preview_with_limit(text: &str, limit: usize) -> String {
    let collapsed = collapse_whitespace(text);
    if collapsed.chars().count() <= limit {
        return collapsed;
    }
    let mut cut: String = collapsed.chars().take(limit).collect();
    cut.push_str(ELLIPSIS);
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_result_shown_in_full() {
        let text = "mean=4.2, median=4.0";
        assert_eq!(preview(text), text);
    }

    #[test]
    fn test_exactly_limit_is_not_truncated() {
        let text = "x".repeat(PREVIEW_CHARS);
        assert_eq!(preview(&text), text);
    }

    #[test]
    fn test_long_result_truncated_with_marker() {
        let text = "a".repeat(PREVIEW_CHARS + 1);
        let out = preview(&text);
        assert_eq!(out, format!("{}...", "a".repeat(PREVIEW_CHARS)));
    }

    #[test]
    fn test_whitespace_collapsed_before_measuring() {
        let text = "col_a   col_b\n\n  col_c\tcol_d";
        assert_eq!(preview(text), "col_a col_b col_c col_d");
    }

    #[test]
    fn test_multibyte_not_split() {
        let text = "é".repeat(60);
        let out = preview(&text);
        assert_eq!(out.chars().count(), PREVIEW_CHARS + ELLIPSIS.len());
        assert!(out.starts_with("ééé"));
    }
}
