//! Inbound message routing
//!
//! Decides whether an envelope deserves a reply, picks the command it
//! carries and pushes the outcome onto the outbox. Collaborator failures
//! never escape: they are logged and turned into an apology for the sender.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::context::ConversationManager;
use crate::providers::ImageBackend;
use crate::signal::{Envelope, EnvelopeHandler, EnvelopeKind, Outbox, SendTask};

/// Clears the sender's conversation
pub const RESET_COMMAND: &str = "/reset";

/// Prefix requesting an image straight from the prompt
pub const DIRECT_IMAGE_PREFIX: &str = "xx";

/// Marker requesting an image whose prompt the assistant writes
pub const ASSISTED_IMAGE_MARKER: char = ';';

const RESET_DONE: &str = "Conversation history reset.";
const RESET_MISSING: &str = "Could not find conversation to reset.";
const DIRECT_IMAGE_USAGE: &str = "Please provide a prompt after 'xx'. Example: xx a cute cat";
const ASSISTED_IMAGE_FAILED: &str = "Sorry, I couldn't generate the image.";
const GENERIC_APOLOGY: &str = "Sorry, something went wrong while handling your message.";

/// Command carried by a message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// `/reset`
    Reset,
    /// `xx <prompt>`; the prompt may be empty
    DirectImage(&'a str),
    /// Body containing `;`
    AssistedImage(&'a str),
    /// Anything else
    Chat(&'a str),
}

impl<'a> Command<'a> {
    /// Classify a body; the first matching rule wins
    ///
    /// Matching is case-insensitive on the trimmed body, while the returned
    /// text keeps the sender's casing.
    #[must_use]
    pub fn parse(body: &'a str) -> Self {
        let body = body.trim();
        let folded = body.to_lowercase();

        if folded == RESET_COMMAND {
            Self::Reset
        } else if folded.starts_with(DIRECT_IMAGE_PREFIX) {
            let prompt = body.get(DIRECT_IMAGE_PREFIX.len()..).unwrap_or_default();
            Self::DirectImage(prompt.trim())
        } else if body.contains(ASSISTED_IMAGE_MARKER) {
            Self::AssistedImage(body)
        } else {
            Self::Chat(body)
        }
    }
}

/// Instruction asking the assistant to turn a request into an image prompt
#[must_use]
pub fn image_prompt_instruction(request: &str) -> String {
    format!(
        "Based on the following user request, write a detailed prompt for an AI image \
         generator. Avoid full sentences: use mostly single words and two-word phrases \
         separated by commas, with at least 20 descriptors. Describe the appearance of any \
         character involved and keep the prompt relevant to what is currently happening in \
         the conversation. Limit the prompt to 300 characters. User request: '{request}'"
    )
}

/// Routes envelopes from the reader task to commands and replies
pub struct MessageRouter {
    identity: String,
    conversations: ConversationManager,
    images: Arc<dyn ImageBackend>,
    outbox: Outbox,
}

impl MessageRouter {
    /// Create a router answering on behalf of `identity`
    #[must_use]
    pub fn new(
        identity: impl Into<String>,
        conversations: ConversationManager,
        images: Arc<dyn ImageBackend>,
        outbox: Outbox,
    ) -> Self {
        Self {
            identity: identity.into(),
            conversations,
            images,
            outbox,
        }
    }

    /// Conversation state
    #[must_use]
    pub const fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    /// Reply target and body, if the envelope deserves a reply
    #[must_use]
    pub fn accept<'e>(&self, envelope: &'e Envelope) -> Option<(&'e str, &'e str)> {
        match &envelope.kind {
            EnvelopeKind::Ignored(kind) => {
                tracing::trace!(kind, "ignoring envelope");
                return None;
            }
            EnvelopeKind::Direct { .. } if envelope.is_from(&self.identity) => {
                tracing::debug!("ignoring own message");
                return None;
            }
            EnvelopeKind::SentCopy { .. } if !envelope.kind.addressed_to(&self.identity) => {
                tracing::debug!("ignoring sent copy addressed elsewhere");
                return None;
            }
            EnvelopeKind::Direct { .. } | EnvelopeKind::SentCopy { .. } => {}
        }

        let Some(sender) = envelope.sender() else {
            tracing::debug!("ignoring envelope without sender");
            return None;
        };
        let body = envelope.body().map(str::trim).filter(|b| !b.is_empty())?;
        Some((sender, body))
    }

    /// Handle one envelope
    pub async fn route(&mut self, envelope: &Envelope) {
        let Some((sender, body)) = self.accept(envelope) else {
            return;
        };

        let command = Command::parse(body);
        tracing::info!(sender, command = command.name(), "dispatching message");

        if let Err(e) = self.dispatch(sender, command).await {
            tracing::error!(sender, error = %e, "dispatch failed");
            self.outbox.push_text(sender, GENERIC_APOLOGY);
        }
    }

    async fn dispatch(&mut self, sender: &str, command: Command<'_>) -> Result<()> {
        match command {
            Command::Reset => {
                let reply = if self.conversations.reset(sender) {
                    RESET_DONE
                } else {
                    RESET_MISSING
                };
                self.outbox.push_text(sender, reply);
            }
            Command::DirectImage("") => {
                self.outbox.push_text(sender, DIRECT_IMAGE_USAGE);
            }
            Command::DirectImage(prompt) => match self.render(prompt).await {
                Some(path) => {
                    self.outbox.push(
                        SendTask::text(sender, format!("Direct image for '{prompt}':"))
                            .with_attachments(vec![path]),
                    );
                }
                None => {
                    self.outbox.push_text(
                        sender,
                        format!("Sorry, failed to generate image directly for: '{prompt}'"),
                    );
                }
            },
            Command::AssistedImage(request) => {
                let derived = self
                    .conversations
                    .send(sender, &image_prompt_instruction(request))
                    .await?;
                let derived = derived.trim();
                if derived.is_empty() {
                    return Err(crate::Error::Backend(
                        "assistant returned an empty image prompt".to_string(),
                    ));
                }

                match self.render(derived).await {
                    Some(path) => {
                        self.outbox
                            .push(SendTask::text(sender, "").with_attachments(vec![path]));
                    }
                    None => {
                        self.outbox.push_text(sender, ASSISTED_IMAGE_FAILED);
                    }
                }
            }
            Command::Chat(text) => {
                let reply = self.conversations.send(sender, text).await?;
                self.outbox.push_text(sender, reply);
            }
        }
        Ok(())
    }

    async fn render(&self, prompt: &str) -> Option<PathBuf> {
        match self.images.generate(prompt).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(backend = self.images.name(), error = %e, "image generation failed");
                None
            }
        }
    }
}

impl Command<'_> {
    /// Short label for logging
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::DirectImage(_) => "direct_image",
            Self::AssistedImage(_) => "assisted_image",
            Self::Chat(_) => "chat",
        }
    }
}

#[async_trait]
impl EnvelopeHandler for MessageRouter {
    async fn handle(&mut self, envelope: Envelope) {
        self.route(&envelope).await;
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("identity", &self.identity)
            .field("conversations", &self.conversations)
            .field("images", &self.images.name())
            .finish_non_exhaustive()
    }
}
