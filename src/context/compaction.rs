//! History summarization
//!
//! When a conversation grows past a token threshold, everything except the
//! persona is summarized via the chat backend and replaced with a single
//! system summary turn. A later pass folds the previous summary and the newer
//! turns into one consolidated summary.

use super::{Role, Turn};

/// Prefix carried by every summary turn
pub const SUMMARY_HEADER: &str = "[Conversation summary]";

/// Approximates the token cost of text
pub trait TokenCounter: Send + Sync {
    /// Approximate token count of `text`
    fn count(&self, text: &str) -> usize;
}

/// Whitespace-separated word count
#[derive(Debug, Default, Clone, Copy)]
pub struct WordCount;

impl TokenCounter for WordCount {
    fn count(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn count(&self, text: &str) -> usize {
        self(text)
    }
}

/// Configuration for history compaction
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Summarize when the history's approximate token count exceeds this
    pub token_threshold: usize,
    /// Hard cap on turns kept per conversation
    pub max_messages: usize,
    /// Word budget requested from the summarizer
    pub summary_words: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            token_threshold: 3000,
            max_messages: 50,
            summary_words: 200,
        }
    }
}

impl CompactionConfig {
    /// Check if summarization is needed for a history of `tokens`
    #[must_use]
    pub const fn needs_summary(&self, tokens: usize) -> bool {
        tokens > self.token_threshold
    }
}

/// Approximate token count of a whole history
#[must_use]
pub fn history_tokens(turns: &[Turn], counter: &dyn TokenCounter) -> usize {
    turns.iter().map(|t| counter.count(&t.content)).sum()
}

/// Whether `turn` is a summary produced by a previous pass
#[must_use]
pub fn is_summary(turn: &Turn) -> bool {
    turn.role == Role::System && turn.content.starts_with(SUMMARY_HEADER)
}

/// Instruction appended to the history to request a summary
///
/// `consolidate` asks the backend to merge an existing summary with the
/// turns that followed it.
#[must_use]
pub fn summary_instruction(consolidate: bool, words: usize) -> String {
    if consolidate {
        format!(
            "The system message starting with {SUMMARY_HEADER} summarizes earlier parts of \
             this conversation. Merge it with everything said since into one consolidated \
             summary, preserving key facts, decisions, and user preferences. \
             Keep it under {words} words."
        )
    } else {
        format!(
            "Summarize the conversation so far concisely, preserving key facts, \
             decisions, and user preferences. Keep it under {words} words."
        )
    }
}

/// Build the system turn that replaces summarized history
#[must_use]
pub fn summary_turn(summary: &str) -> Turn {
    Turn::system(format!("{SUMMARY_HEADER}\n{}", summary.trim()))
}
