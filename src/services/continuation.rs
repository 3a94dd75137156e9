use crate::providers::{ChatMessage, ChatRequest};
use crate::services::accumulator::{normalize, strip_meta_preamble};

pub const FENCE_MARKER: &str = "```";

pub const DEFAULT_TAIL_CHARS: usize = 800;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;

const CONTINUE_INSTRUCTION: &str = "The response below was cut off inside a code block. \
Continue it exactly where it stops, without repeating anything and without any preamble, \
and close the open code block with ``` when the code is complete.";

/// An odd number of fence markers means a block was opened and never closed.
pub fn has_unclosed_fence(text: &str) -> bool {
    text.matches(FENCE_MARKER).count() % 2 == 1
}

/// The last `max_chars` characters of `text`.
pub fn tail(text: &str, max_chars: usize) -> &str {
    if max_chars == 0 {
        return "";
    }
    match text.char_indices().rev().nth(max_chars - 1) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationPolicy {
    pub max_attempts: u32,
    pub tail_chars: usize,
}

impl Default for ContinuationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            tail_chars: DEFAULT_TAIL_CHARS,
        }
    }
}

/// Raw text of the in-flight answer plus how many repairs it has used.
/// Trailing whitespace is kept so a continuation splices on exactly where
/// the model stopped.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    text: String,
    attempts: u32,
}

impl PendingTurn {
    pub fn new(text: String) -> Self {
        Self { text, attempts: 0 }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Fence parity of the text as it will be stored.
    pub fn is_unterminated(&self) -> bool {
        has_unclosed_fence(&normalize(&self.text))
    }

    /// Normalized once, after the last repair.
    pub fn into_settled(self) -> String {
        normalize(&self.text)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContinuationController {
    policy: ContinuationPolicy,
}

impl ContinuationController {
    pub fn new(policy: ContinuationPolicy) -> Self {
        Self { policy }
    }

    pub fn needs_repair(&self, turn: &PendingTurn) -> bool {
        turn.attempts < self.policy.max_attempts && turn.is_unterminated()
    }

    /// Build the follow-up request and charge one attempt against the turn.
    pub fn repair_request(&self, turn: &mut PendingTurn, base: &ChatRequest) -> ChatRequest {
        turn.attempts += 1;
        tracing::debug!(
            attempt = turn.attempts,
            max_attempts = self.policy.max_attempts,
            "Requesting continuation for unterminated code block"
        );

        let prompt = format!(
            "{}\n\n--- response so far ---\n{}",
            CONTINUE_INSTRUCTION,
            tail(&turn.text, self.policy.tail_chars)
        );

        ChatRequest {
            model: base.model.clone(),
            messages: vec![ChatMessage::user(prompt)],
            system_prompt: base.system_prompt.clone(),
            options: base.options.clone(),
        }
    }

    /// Splice a continuation onto the raw text.
    pub fn absorb(&self, turn: &mut PendingTurn, continuation: &str) {
        let piece = strip_meta_preamble(&continuation.replace("\r\n", "\n"));
        if piece.trim().is_empty() {
            return;
        }

        if !turn.text.ends_with('\n') && piece.trim_start().starts_with(FENCE_MARKER) {
            turn.text.push('\n');
        }
        turn.text.push_str(&piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatOptions;

    fn base_request() -> ChatRequest {
        ChatRequest {
            model: "qwen2.5-coder".to_string(),
            messages: vec![ChatMessage::user("write fizzbuzz")],
            system_prompt: Some("You are terse.".to_string()),
            options: ChatOptions {
                temperature: Some(0.1),
            },
        }
    }

    #[test]
    fn test_fence_parity() {
        assert!(!has_unclosed_fence("no code"));
        assert!(has_unclosed_fence("```rust\nfn main() {"));
        assert!(!has_unclosed_fence("```rust\nfn main() {}\n```"));
        assert!(has_unclosed_fence("```a```\n```b"));
    }

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("abc", 10), "abc");
        assert_eq!(tail("abc", 0), "");
        assert_eq!(tail("h\u{e9}llo w\u{f6}rld", 5), "w\u{f6}rld");
    }

    #[test]
    fn test_repair_request_carries_tail_and_instruction() {
        let controller = ContinuationController::new(ContinuationPolicy {
            max_attempts: 1,
            tail_chars: 10,
        });
        let mut turn = PendingTurn::new("0123456789ABCDEFGHIJ```py\nprint(".to_string());

        assert!(controller.needs_repair(&turn));
        let request = controller.repair_request(&mut turn, &base_request());

        assert_eq!(turn.attempts(), 1);
        assert_eq!(request.model, "qwen2.5-coder");
        assert_eq!(request.system_prompt.as_deref(), Some("You are terse."));
        assert_eq!(request.messages.len(), 1);
        let prompt = &request.messages[0].content;
        assert!(prompt.starts_with(CONTINUE_INSTRUCTION));
        assert!(prompt.ends_with("--- response so far ---\n`py\nprint("));
        assert!(!prompt.contains("0123456789"));
    }

    #[test]
    fn test_budget_is_exhausted_after_one_attempt() {
        let controller = ContinuationController::new(ContinuationPolicy::default());
        let mut turn = PendingTurn::new("```\nopen".to_string());

        assert!(controller.needs_repair(&turn));
        controller.repair_request(&mut turn, &base_request());
        controller.absorb(&mut turn, "still going");

        assert!(has_unclosed_fence(turn.text()));
        assert!(!controller.needs_repair(&turn));
    }

    #[test]
    fn test_absorb_closes_block_and_drops_preamble() {
        let controller = ContinuationController::new(ContinuationPolicy::default());
        let mut turn = PendingTurn::new("```python\nfor i in range(3):".to_string());

        controller.absorb(&mut turn, "Continuing:\n\n    print(i)\n```\n");
        assert!(!controller.needs_repair(&turn));
        assert_eq!(
            turn.into_settled(),
            "```python\nfor i in range(3):\n    print(i)\n```"
        );
    }

    #[test]
    fn test_absorb_puts_bare_fence_on_its_own_line() {
        let controller = ContinuationController::new(ContinuationPolicy::default());
        let mut turn = PendingTurn::new("```\nx = 1".to_string());

        controller.absorb(&mut turn, "```");
        assert_eq!(turn.text(), "```\nx = 1\n```");
    }

    #[test]
    fn test_trailing_newline_survives_into_tail_and_splice() {
        let controller = ContinuationController::new(ContinuationPolicy::default());
        let mut turn = PendingTurn::new("Sure!\n```python\nfor i in range(3):\n".to_string());

        assert!(controller.needs_repair(&turn));
        let request = controller.repair_request(&mut turn, &base_request());
        assert!(request.messages[0].content.ends_with("for i in range(3):\n"));

        controller.absorb(&mut turn, "    print(i)\n```");
        assert!(!turn.is_unterminated());
        assert_eq!(
            turn.into_settled(),
            "```python\nfor i in range(3):\n    print(i)\n```"
        );
    }

    #[test]
    fn test_empty_continuation_changes_nothing() {
        let controller = ContinuationController::new(ContinuationPolicy::default());
        let mut turn = PendingTurn::new("```\nx".to_string());
        controller.absorb(&mut turn, "  \n");
        assert_eq!(turn.text(), "```\nx");
    }
}
