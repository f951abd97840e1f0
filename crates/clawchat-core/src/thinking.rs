use once_cell::sync::Lazy;
use regex::Regex;

/// Opening and closing reasoning-trace markers, case-insensitive.
/// Longest alternatives first so `<thinking>` is never matched as `<think>`.
static THINKING_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(?:antthinking|thinking|thought|think)>").expect("valid thinking tag regex")
});

/// Remove reasoning-trace markers from assistant text.
///
/// Only the tags themselves are eliminated; the enclosed text stays, the
/// same way streamed deltas render. Each marker is replaced with a single
/// space and the result is trimmed, so applying the filter twice yields
/// the same output as applying it once.
pub fn strip_thinking_tags(text: &str) -> String {
    THINKING_TAGS.replace_all(text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_all_tag_families() {
        for tag in ["think", "thinking", "thought", "antthinking"] {
            let input = format!("<{tag}>inner</{tag}>after");
            let output = strip_thinking_tags(&input);
            assert!(!output.contains('<'), "tag {tag} survived: {output}");
            assert!(output.contains("inner"));
            assert!(output.contains("after"));
        }
    }

    #[test]
    fn keeps_enclosed_text() {
        assert_eq!(
            strip_thinking_tags("<think>deliberating</think>Answer: 42"),
            "deliberating Answer: 42"
        );
    }

    #[test]
    fn is_case_insensitive() {
        assert_eq!(
            strip_thinking_tags("<THINK>a</Think>b"),
            "a b"
        );
    }

    #[test]
    fn is_idempotent() {
        let once = strip_thinking_tags("<thinking> x </thinking> y ");
        let twice = strip_thinking_tags(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(strip_thinking_tags("hello world"), "hello world");
        assert_eq!(strip_thinking_tags(""), "");
    }

    #[test]
    fn ignores_unrelated_tags() {
        assert_eq!(strip_thinking_tags("<b>bold</b>"), "<b>bold</b>");
    }
}
