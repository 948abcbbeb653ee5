//! Backend collaborators
//!
//! The router and context manager only see these traits; HTTP details live
//! in the implementations.

mod forge;
mod openai;

use std::path::PathBuf;

use async_trait::async_trait;

pub use forge::{ForgeClient, ForgeSettings, ImageRef, extract_image_ref};
pub use openai::OpenAiClient;

use crate::context::Turn;
use crate::{Error, Result};

/// Sampling parameters for one completion call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionParams {
    /// Upper bound on generated tokens
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl CompletionParams {
    /// Regular conversational turns
    pub const CHAT: Self = Self {
        max_tokens: 300,
        temperature: 0.8,
    };

    /// History summarization
    pub const SUMMARY: Self = Self {
        max_tokens: 400,
        temperature: 0.3,
    };
}

/// Conversational completion backend
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Produce the assistant reply for `messages`
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unreachable or the reply is malformed
    async fn complete(&self, messages: &[Turn], params: CompletionParams) -> Result<String>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Image generation backend
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Render `prompt` and return the path of the written image file
    ///
    /// # Errors
    ///
    /// Returns error if generation fails
    async fn generate(&self, prompt: &str) -> Result<PathBuf>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Stand-in used when no image backend is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledImages;

#[async_trait]
impl ImageBackend for DisabledImages {
    async fn generate(&self, _prompt: &str) -> Result<PathBuf> {
        Err(Error::Image("image generation is not configured".to_string()))
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}
