//! Markdown rendering for `display_status` before it reaches a render surface.

#![forbid(unsafe_code)]

use once_cell::sync::Lazy;
use regex::Regex;

/// Converts status text to safe output for a render surface. Pure.
pub trait MarkdownRenderer: Send + Sync {
    fn render(&self, text: &str) -> String;
}

static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\(([^)\s]*)\)").unwrap());
static BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"</?[A-Za-z][^>]*>").unwrap());
static STRONG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\*\*|__)([^*_]+)(\*\*|__)").unwrap());
static EMPH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]*)`").unwrap());
static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").unwrap());

/// Plain-text renderer for terminals: drops markup, keeps link targets, and
/// replaces control characters so status text cannot drive the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalMarkdown;

impl MarkdownRenderer for TerminalMarkdown {
    fn render(&self, text: &str) -> String {
        let s = BREAK.replace_all(text, "\n");
        let s = TAG.replace_all(&s, "");
        let s = LINK.replace_all(&s, "$1 <$2>");
        let s = STRONG.replace_all(&s, "$2");
        let s = EMPH.replace_all(&s, "$1");
        let s = CODE.replace_all(&s, "$1");
        let s = HEADING.replace_all(&s, "");
        s.chars()
            .map(|c| if c.is_control() && c != '\n' && c != '\t' { '\u{fffd}' } else { c })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markup_and_keeps_links() {
        let md = TerminalMarkdown;
        assert_eq!(md.render("**PASS** see [log](http://x/y)"), "PASS see log <http://x/y>");
        assert_eq!(md.render("# Title\n`code` and *em*"), "Title\ncode and em");
        assert_eq!(md.render("a<br>b<span class=\"x\">c</span>"), "a\nbc");
    }

    #[test]
    fn control_characters_are_neutralized() {
        let md = TerminalMarkdown;
        assert_eq!(md.render("ok\u{1b}[2J"), "ok\u{fffd}[2J");
        assert_eq!(md.render("snake_case_name"), "snake_case_name");
    }
}
