use std::sync::LazyLock;

use regex::Regex;

/// Preamble lines models like to open with ("Sure! Here's the code:").
static META_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:sure\b|certainly\b|of course\b|here(?:'s| is| are)\b|as requested\b|continuing\b|continued\b|continuation\b)",
    )
    .expect("meta line pattern is valid")
});

/// A newline followed by two or more blank lines.
static BLANK_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n(?:[ \t]*\n){2,}").expect("blank run pattern is valid"));

const MAX_META_LINES: usize = 2;
const MAX_META_LINE_CHARS: usize = 160;

fn is_meta_line(line: &str) -> bool {
    line.trim().chars().count() <= MAX_META_LINE_CHARS && META_LINE.is_match(line)
}

/// Drop a leading run of one or two meta lines (blank lines in between are
/// skipped). Longer runs, or a run with nothing after it, are left alone.
pub(crate) fn strip_meta_preamble(text: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let mut meta = 0;
    let mut cut = 0;

    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        if !is_meta_line(line) {
            break;
        }
        meta += 1;
        cut = i + 1;
        if meta > MAX_META_LINES {
            return text.to_string();
        }
    }

    if meta == 0 {
        return text.to_string();
    }

    let rest = lines[cut..].join("\n");
    if rest.trim().is_empty() {
        text.to_string()
    } else {
        rest
    }
}

/// Final cleanup of a settled answer. Idempotent.
pub fn normalize(text: &str) -> String {
    let text = text.replace("\r\n", "\n");
    let text = strip_meta_preamble(&text);
    let text = BLANK_RUN.replace_all(&text, "\n\n");
    text.trim().to_string()
}

/// Running text of one generation stream. The owner decides when to hand a
/// snapshot to the UI; nothing here is time-aware.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    buffer: String,
    flushed: usize,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
    }

    pub fn has_pending(&self) -> bool {
        self.buffer.len() > self.flushed
    }

    /// Snapshot of the whole running text, if anything arrived since the
    /// last snapshot.
    pub fn take_pending(&mut self) -> Option<String> {
        if !self.has_pending() {
            return None;
        }
        self.flushed = self.buffer.len();
        Some(self.buffer.clone())
    }

    /// Forget text that was received but never shown.
    pub fn discard_pending(&mut self) {
        self.buffer.truncate(self.flushed);
    }

    pub fn flushed_text(&self) -> &str {
        &self.buffer[..self.flushed]
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// Reconcile with the producer's own idea of the full text. Only a
    /// missing tail is taken over; our buffer is never rewritten.
    pub fn settle(&mut self, producer_text: &str) {
        if producer_text.len() > self.buffer.len() && producer_text.starts_with(&self.buffer) {
            let missing = &producer_text[self.buffer.len()..];
            self.buffer.push_str(missing);
        }
    }

    pub fn into_raw(self) -> String {
        self.buffer
    }

    pub fn finish(self) -> String {
        normalize(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_keep_arrival_order() {
        let mut acc = ResponseAccumulator::new();
        for piece in ["fn ", "main", "() {", "}"] {
            acc.push(piece);
        }
        assert_eq!(acc.text(), "fn main() {}");
    }

    #[test]
    fn test_take_pending_only_when_new_text_arrived() {
        let mut acc = ResponseAccumulator::new();
        assert!(acc.take_pending().is_none());

        acc.push("ab");
        acc.push("cd");
        assert_eq!(acc.take_pending().as_deref(), Some("abcd"));
        assert!(acc.take_pending().is_none());

        acc.push("e");
        assert_eq!(acc.take_pending().as_deref(), Some("abcde"));
    }

    #[test]
    fn test_discard_pending_keeps_flushed_text() {
        let mut acc = ResponseAccumulator::new();
        acc.push("shown ");
        acc.take_pending();
        acc.push("never shown");

        acc.discard_pending();
        assert_eq!(acc.text(), "shown ");
        assert_eq!(acc.flushed_text(), "shown ");
        assert!(!acc.has_pending());
    }

    #[test]
    fn test_settle_only_appends_missing_tail() {
        let mut acc = ResponseAccumulator::new();
        acc.push("hello");
        acc.settle("hello world");
        assert_eq!(acc.text(), "hello world");

        acc.settle("something else entirely");
        assert_eq!(acc.text(), "hello world");
    }

    #[test]
    fn test_finish_normalizes_once_at_the_end() {
        let mut acc = ResponseAccumulator::new();
        acc.push("Sure! Here's the answer:\n\n\n\n");
        assert_eq!(acc.take_pending().as_deref(), Some("Sure! Here's the answer:\n\n\n\n"));
        acc.push("42\n");
        assert_eq!(acc.finish(), "42");
    }

    #[test]
    fn test_strips_at_most_two_meta_lines() {
        assert_eq!(normalize("Sure!\nHere is the fix:\nlet x = 1;"), "let x = 1;");
        assert_eq!(normalize("CERTAINLY.\n\nlet x = 1;"), "let x = 1;");
        assert_eq!(
            normalize("Sure.\nCertainly.\nOf course.\nbody"),
            "Sure.\nCertainly.\nOf course.\nbody"
        );
    }

    #[test]
    fn test_meta_only_reply_is_kept() {
        assert_eq!(normalize("Sure, happy to help."), "Sure, happy to help.");
    }

    #[test]
    fn test_long_first_line_is_content_not_preamble() {
        let long = format!("Here is {}", "a very long sentence ".repeat(10));
        let text = format!("{}\nsecond line", long);
        assert_eq!(normalize(&text), text);
    }

    #[test]
    fn test_collapses_blank_runs_and_trims() {
        assert_eq!(normalize("\n\n  a\n\n\n\nb\n \n\t\nc\n\nd  \n"), "a\n\nb\n\nc\n\nd");
        assert_eq!(normalize("a\r\n\r\n\r\nb"), "a\n\nb");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "Sure!\n\nHere's the code:\n\n\n```rust\nfn main() {}\n```\n\n\n\nDone.",
            "Sure.\nCertainly.\nOf course.\nbody",
            "Sure!\n\nHere's code:",
            "   plain text   ",
            "Here is one\n\n\nHere is two\nHere is three\ncontent",
            "",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", sample);
        }
    }
}
