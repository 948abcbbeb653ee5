//! Per-sender conversation context
//!
//! Each sender gets an ordered history seeded with the persona prompt. Every
//! mutation re-normalizes the history so the persona sits at index 0, other
//! system turns (summaries) follow it, and dialogue turns come last in
//! chronological order.

pub mod compaction;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use compaction::{CompactionConfig, TokenCounter, WordCount};

use crate::Result;
use crate::providers::{ChatBackend, CompletionParams};

/// Speaker of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions and summaries
    System,
    /// The remote person
    User,
    /// The bot
    Assistant,
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Speaker
    pub role: Role,
    /// Text
    pub content: String,
}

impl Turn {
    /// Create a system turn
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a user turn
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant turn
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// History of one sender
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// Fresh history holding only the persona
    #[must_use]
    pub fn seeded(persona: &str) -> Self {
        Self {
            turns: vec![Turn::system(persona)],
        }
    }

    /// Read-only view of the turns
    #[must_use]
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Number of turns
    #[must_use]
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether the history is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn is_persona(turn: &Turn, persona: &str) -> bool {
        turn.role == Role::System && turn.content == persona
    }

    /// Whether anything besides the persona is present
    fn has_content_beyond(&self, persona: &str) -> bool {
        self.turns.iter().any(|t| !Self::is_persona(t, persona))
    }

    fn has_summary(&self) -> bool {
        self.turns.iter().any(compaction::is_summary)
    }

    /// Reorder into `[persona] ++ other system turns ++ dialogue`
    ///
    /// Duplicate persona turns are dropped; relative order within each group
    /// is preserved.
    fn normalize(&mut self, persona: &str) {
        let mut head: Option<Turn> = None;
        let mut system = Vec::new();
        let mut dialogue = Vec::with_capacity(self.turns.len());

        for turn in self.turns.drain(..) {
            if Self::is_persona(&turn, persona) {
                if head.is_none() {
                    head = Some(turn);
                }
            } else if turn.role == Role::System {
                system.push(turn);
            } else {
                dialogue.push(turn);
            }
        }

        self.turns.extend(head);
        self.turns.extend(system);
        self.turns.extend(dialogue);
    }

    /// Evict the oldest non-system turns until at most `max` remain
    fn enforce_cap(&mut self, max: usize) {
        let Some(mut excess) = self.turns.len().checked_sub(max).filter(|n| *n > 0) else {
            return;
        };
        self.turns.retain(|turn| {
            if excess > 0 && turn.role != Role::System {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    /// Append a completed exchange
    fn record(&mut self, user: Turn, reply: Turn) {
        if self.turns.last() != Some(&user) {
            self.turns.push(user);
        }
        self.turns.push(reply);
    }

    /// Replace everything except the persona with `summary`
    fn collapse(&mut self, persona: &str, summary: Turn) {
        self.turns.retain(|t| Self::is_persona(t, persona));
        self.turns.push(summary);
    }
}

/// Owns every sender's history and talks to the chat backend
pub struct ConversationManager {
    persona: String,
    config: CompactionConfig,
    backend: Arc<dyn ChatBackend>,
    counter: Box<dyn TokenCounter>,
    conversations: HashMap<String, Conversation>,
}

impl ConversationManager {
    /// Create a manager with the default word-count tokenizer
    #[must_use]
    pub fn new(
        persona: impl Into<String>,
        backend: Arc<dyn ChatBackend>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            persona: persona.into(),
            config,
            backend,
            counter: Box::new(WordCount),
            conversations: HashMap::new(),
        }
    }

    /// Replace the token counter
    #[must_use]
    pub fn with_token_counter(mut self, counter: impl TokenCounter + 'static) -> Self {
        self.counter = Box::new(counter);
        self
    }

    /// Persona prompt seeding every conversation
    #[must_use]
    pub fn persona(&self) -> &str {
        &self.persona
    }

    /// Number of tracked senders
    #[must_use]
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    /// Whether no sender has been seen yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    /// Read-only history for `sender`
    #[must_use]
    pub fn history(&self, sender: &str) -> Option<&[Turn]> {
        self.conversations.get(sender).map(Conversation::turns)
    }

    /// Clear `sender`'s history back to the persona
    ///
    /// Returns whether the sender was already known. An unknown sender is
    /// still seeded.
    pub fn reset(&mut self, sender: &str) -> bool {
        let existed = self
            .conversations
            .insert(sender.to_string(), Conversation::seeded(&self.persona))
            .is_some();
        tracing::debug!(sender, existed, "conversation reset");
        existed
    }

    /// Send `prompt` on behalf of `sender` and return the reply
    ///
    /// Summarization runs first when the history is over the token
    /// threshold; a failed summarization is logged and the history is left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns error if the chat backend fails. The history is not modified
    /// in that case.
    pub async fn send(&mut self, sender: &str, prompt: &str) -> Result<String> {
        self.summarize_if_needed(sender).await;

        let user = Turn::user(prompt);
        let mut messages = self.entry(sender).turns().to_vec();
        messages.push(user.clone());

        let reply = self
            .backend
            .complete(&messages, CompletionParams::CHAT)
            .await?;

        let (persona, max) = (&self.persona, self.config.max_messages);
        let conversation = self
            .conversations
            .entry(sender.to_string())
            .or_insert_with(|| Conversation::seeded(persona));
        conversation.record(user, Turn::assistant(reply.clone()));
        conversation.normalize(persona);
        conversation.enforce_cap(max);

        tracing::debug!(sender, turns = conversation.len(), "exchange recorded");
        Ok(reply)
    }

    fn entry(&mut self, sender: &str) -> &mut Conversation {
        let persona = &self.persona;
        self.conversations
            .entry(sender.to_string())
            .or_insert_with(|| Conversation::seeded(persona))
    }

    async fn summarize_if_needed(&mut self, sender: &str) {
        let persona = self.persona.clone();
        self.entry(sender).normalize(&persona);
        let conversation = &self.conversations[sender];

        let tokens = compaction::history_tokens(conversation.turns(), self.counter.as_ref());
        if !self.config.needs_summary(tokens) || !conversation.has_content_beyond(&persona) {
            return;
        }

        let consolidate = conversation.has_summary();
        let mut messages = conversation.turns().to_vec();
        messages.push(Turn::user(compaction::summary_instruction(
            consolidate,
            self.config.summary_words,
        )));

        match self
            .backend
            .complete(&messages, CompletionParams::SUMMARY)
            .await
        {
            Ok(summary) if !summary.trim().is_empty() => {
                let summary = compaction::summary_turn(&summary);
                let summary_tokens = self.counter.count(&summary.content);
                let conversation = self.entry(sender);
                let removed = conversation.len().saturating_sub(1);
                conversation.collapse(&persona, summary);
                conversation.normalize(&persona);
                tracing::info!(
                    sender,
                    tokens,
                    removed,
                    summary_tokens,
                    consolidate,
                    "conversation summarized"
                );
            }
            Ok(_) => {
                tracing::warn!(sender, tokens, "summarizer returned empty text, keeping history");
            }
            Err(e) => {
                tracing::warn!(sender, tokens, error = %e, "summarization failed, keeping history");
            }
        }
    }
}

impl std::fmt::Debug for ConversationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationManager")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("conversations", &self.conversations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::Error;

    const PERSONA: &str = "You are a helpful assistant";

    /// Replays canned replies and records every request
    #[derive(Default)]
    struct ScriptedBackend {
        replies: Mutex<VecDeque<Result<String>>>,
        calls: Mutex<Vec<(Vec<Turn>, CompletionParams)>>,
    }

    impl ScriptedBackend {
        fn with(replies: impl IntoIterator<Item = Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().collect()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<(Vec<Turn>, CompletionParams)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, messages: &[Turn], params: CompletionParams) -> Result<String> {
            self.calls.lock().unwrap().push((messages.to_vec(), params));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("ok".to_string()))
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn manager(backend: Arc<ScriptedBackend>, config: CompactionConfig) -> ConversationManager {
        ConversationManager::new(PERSONA, backend, config)
    }

    fn ok(text: &str) -> Result<String> {
        Ok(text.to_string())
    }

    #[tokio::test]
    async fn first_send_seeds_persona() {
        let backend = ScriptedBackend::with([ok("hello there")]);
        let mut mgr = manager(backend.clone(), CompactionConfig::default());

        let reply = mgr.send("alice", "hi").await.unwrap();
        assert_eq!(reply, "hello there");

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, vec![Turn::system(PERSONA), Turn::user("hi")]);
        assert_eq!(calls[0].1, CompletionParams::CHAT);

        assert_eq!(
            mgr.history("alice").unwrap(),
            [
                Turn::system(PERSONA),
                Turn::user("hi"),
                Turn::assistant("hello there")
            ]
        );
    }

    #[tokio::test]
    async fn senders_are_isolated() {
        let backend = ScriptedBackend::with([ok("a1"), ok("b1")]);
        let mut mgr = manager(backend, CompactionConfig::default());

        mgr.send("alice", "from alice").await.unwrap();
        mgr.send("bob", "from bob").await.unwrap();

        assert_eq!(mgr.len(), 2);
        let alice = mgr.history("alice").unwrap();
        assert!(alice.iter().all(|t| t.content != "from bob"));
    }

    #[tokio::test]
    async fn backend_failure_leaves_history_untouched() {
        let backend = ScriptedBackend::with([
            ok("first"),
            Err(Error::Backend("connection refused".to_string())),
        ]);
        let mut mgr = manager(backend, CompactionConfig::default());

        mgr.send("alice", "one").await.unwrap();
        let before = mgr.history("alice").unwrap().to_vec();

        assert!(mgr.send("alice", "two").await.is_err());
        assert_eq!(mgr.history("alice").unwrap(), before);
    }

    #[tokio::test]
    async fn reset_reports_known_senders() {
        let backend = ScriptedBackend::with([]);
        let mut mgr = manager(backend, CompactionConfig::default());

        assert!(!mgr.reset("stranger"));
        assert_eq!(mgr.history("stranger").unwrap(), [Turn::system(PERSONA)]);

        mgr.send("alice", "hi").await.unwrap();
        assert!(mgr.reset("alice"));
        assert_eq!(mgr.history("alice").unwrap(), [Turn::system(PERSONA)]);
    }

    #[tokio::test]
    async fn over_threshold_summarizes_before_sending() {
        let backend = ScriptedBackend::with([
            ok("one two three four five"),
            ok("user said many words"),
            ok("short"),
        ]);
        let config = CompactionConfig {
            token_threshold: 8,
            ..Default::default()
        };
        let mut mgr = manager(backend.clone(), config);

        // 5 persona words + 1 + 5 = 11 tokens, over the threshold
        mgr.send("alice", "hello").await.unwrap();
        let reply = mgr.send("alice", "next").await.unwrap();
        assert_eq!(reply, "short");

        let calls = backend.calls();
        assert_eq!(calls.len(), 3);

        let (summary_request, params) = &calls[1];
        assert_eq!(*params, CompletionParams::SUMMARY);
        let instruction = summary_request.last().unwrap();
        assert_eq!(instruction.role, Role::User);
        assert!(instruction.content.contains("under 200 words"));

        let (chat_request, _) = &calls[2];
        assert_eq!(
            chat_request,
            &vec![
                Turn::system(PERSONA),
                Turn::system("[Conversation summary]\nuser said many words"),
                Turn::user("next"),
            ]
        );

        let history = mgr.history("alice").unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(
            history.iter().filter(|t| t.role == Role::System).count(),
            2
        );
    }

    #[tokio::test]
    async fn second_pass_consolidates_previous_summary() {
        let backend = ScriptedBackend::with([
            ok("reply"),
            ok("first summary"),
            ok("reply"),
            ok("merged summary"),
            ok("reply"),
        ]);
        let config = CompactionConfig {
            token_threshold: 6,
            ..Default::default()
        };
        let mut mgr = manager(backend.clone(), config);

        mgr.send("alice", "a").await.unwrap();
        mgr.send("alice", "b").await.unwrap();
        mgr.send("alice", "c").await.unwrap();

        let calls = backend.calls();
        let (request, _) = &calls[3];
        assert!(request.last().unwrap().content.contains("consolidated"));

        let history = mgr.history("alice").unwrap();
        let summaries: Vec<_> = history
            .iter()
            .filter(|t| compaction::is_summary(t))
            .collect();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].content.ends_with("merged summary"));
    }

    #[tokio::test]
    async fn failed_summary_keeps_history() {
        let backend = ScriptedBackend::with([
            ok("reply"),
            Err(Error::Backend("timeout".to_string())),
            ok("still here"),
        ]);
        let config = CompactionConfig {
            token_threshold: 3,
            ..Default::default()
        };
        let mut mgr = manager(backend, config);

        mgr.send("alice", "hello").await.unwrap();
        let reply = mgr.send("alice", "again").await.unwrap();
        assert_eq!(reply, "still here");

        let history = mgr.history("alice").unwrap();
        assert_eq!(history.len(), 5);
        assert!(!history.iter().any(compaction::is_summary));
    }

    #[tokio::test]
    async fn cap_evicts_oldest_dialogue_only() {
        let backend = ScriptedBackend::with([]);
        let config = CompactionConfig {
            max_messages: 5,
            token_threshold: usize::MAX,
            ..Default::default()
        };
        let mut mgr = manager(backend, config);

        for i in 0..4 {
            mgr.send("alice", &format!("msg {i}")).await.unwrap();
        }

        let history = mgr.history("alice").unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0], Turn::system(PERSONA));
        assert_eq!(history[1], Turn::user("msg 2"));
        assert_eq!(history[3], Turn::user("msg 3"));
    }

    #[test]
    fn normalize_moves_persona_first_and_dedups() {
        let mut conversation = Conversation {
            turns: vec![
                Turn::user("hi"),
                Turn::system("[Conversation summary]\nold"),
                Turn::system(PERSONA),
                Turn::assistant("hello"),
                Turn::system(PERSONA),
            ],
        };
        conversation.normalize(PERSONA);

        assert_eq!(
            conversation.turns(),
            [
                Turn::system(PERSONA),
                Turn::system("[Conversation summary]\nold"),
                Turn::user("hi"),
                Turn::assistant("hello"),
            ]
        );
    }

    #[test]
    fn cap_never_evicts_system_turns() {
        let mut conversation = Conversation {
            turns: vec![
                Turn::system(PERSONA),
                Turn::system("[Conversation summary]\nx"),
                Turn::system("[Conversation summary]\ny"),
            ],
        };
        conversation.enforce_cap(1);
        assert_eq!(conversation.len(), 3);
    }

    #[test]
    fn record_skips_duplicate_trailing_user_turn() {
        let mut conversation = Conversation::seeded(PERSONA);
        conversation.turns.push(Turn::user("same"));
        conversation.record(Turn::user("same"), Turn::assistant("reply"));
        assert_eq!(conversation.len(), 3);
    }
}
