//! Splitting assistant replies into deliverable chunks.

use std::sync::LazyLock;

use regex::Regex;

/// One or more blank lines (whitespace-only lines count as blank).
static PARAGRAPH_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t\r]*\n").expect("valid paragraph regex"));

/// Retrieval citation markers such as `【4:0†source】`.
static CITATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"【[^】]*】").expect("valid citation regex"));

/// Remove citation markers from `text`.
pub fn strip_citations(text: &str) -> String {
    CITATION.replace_all(text, "").into_owned()
}

/// Split a reply at blank-line boundaries, strip citations, trim each piece,
/// and drop pieces left empty. Order is preserved.
pub fn split_reply(text: &str) -> Vec<String> {
    let cleaned = strip_citations(text);
    PARAGRAPH_BREAK
        .split(&cleaned)
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_paragraph() {
        assert_eq!(split_reply("Hello there."), vec!["Hello there."]);
    }

    #[test]
    fn splits_on_blank_lines() {
        let reply = "First.\n\nSecond line one\nSecond line two\n\n\nThird.";
        assert_eq!(
            split_reply(reply),
            vec!["First.", "Second line one\nSecond line two", "Third."]
        );
    }

    #[test]
    fn whitespace_only_lines_are_blank() {
        assert_eq!(split_reply("a\n  \t\nb"), vec!["a", "b"]);
        assert_eq!(split_reply("a\r\n\r\nb"), vec!["a", "b"]);
    }

    #[test]
    fn citations_are_removed() {
        let reply = "The office opens at 9【4:0†source】.\n\n【2:1†faq.pdf】";
        assert_eq!(split_reply(reply), vec!["The office opens at 9."]);
    }

    #[test]
    fn empty_reply_has_no_chunks() {
        assert!(split_reply("").is_empty());
        assert!(split_reply("\n\n  \n").is_empty());
    }

    #[test]
    fn strip_citations_leaves_plain_text() {
        assert_eq!(strip_citations("no markers"), "no markers");
    }
}
