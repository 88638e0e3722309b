//! Provider/model-aware token estimation (C1).
//!
//! Grounded in the heuristic `llm_session.rs` uses to size trimming decisions:
//! roughly 4 characters per token plus a fixed per-message overhead. Real
//! tokenizers are an external concern (out of scope, §1); this module's job is
//! to never let a counting failure propagate, and to overestimate rather than
//! underestimate when it falls back.

use crate::penguin::message::Message;

/// Fixed overhead, in tokens, attributed to each message regardless of its
/// content (role marker, separators, etc.) when no model-specific tokenizer is
/// available.
const PER_MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Characters per token used by the fallback heuristic.
const HEURISTIC_CHARS_PER_TOKEN: usize = 4;

/// Deterministic token estimation for a given `(model, input)` pair.
///
/// Implementations must never propagate errors: on internal failure, return a
/// conservative upper bound so the Context Window Manager overestimates rather
/// than underestimates the cost of a contribution.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str, model: &str) -> usize;

    fn count_message(&self, message: &Message, model: &str) -> usize {
        self.count_text(&message.as_text(), model) + PER_MESSAGE_OVERHEAD_TOKENS
    }

    fn count_messages(&self, messages: &[Message], model: &str) -> usize {
        messages.iter().map(|m| self.count_message(m, model)).sum()
    }
}

/// Provider-agnostic fallback counter: ≈4 chars/token, fixed per-message
/// overhead. Used whenever a model-specific tokenizer is unavailable, and as
/// the default counter wired by [`crate::penguin::orchestrator::Orchestrator`]
/// unless a caller supplies a different [`TokenCounter`].
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count_text(&self, text: &str, _model: &str) -> usize {
        // Round up: overestimating is the documented failure-safe direction.
        let chars = text.chars().count();
        (chars + HEURISTIC_CHARS_PER_TOKEN - 1) / HEURISTIC_CHARS_PER_TOKEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::penguin::message::{Category, Role};

    #[test]
    fn empty_text_counts_zero() {
        let counter = HeuristicTokenCounter;
        assert_eq!(counter.count_text("", "gpt-4"), 0);
    }

    #[test]
    fn rounds_up_partial_tokens() {
        let counter = HeuristicTokenCounter;
        assert_eq!(counter.count_text("abc", "gpt-4"), 1);
        assert_eq!(counter.count_text("abcde", "gpt-4"), 2);
    }

    #[test]
    fn message_count_adds_overhead() {
        let counter = HeuristicTokenCounter;
        let msg = Message::new(Role::User, "abcd", Category::Dialog, "agent-1");
        assert_eq!(counter.count_message(&msg, "gpt-4"), 1 + PER_MESSAGE_OVERHEAD_TOKENS);
    }
}
