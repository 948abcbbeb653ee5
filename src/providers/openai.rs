//! OpenAI-compatible chat completions client
//!
//! Works against any server exposing `/chat/completions` and `/models`
//! (LM Studio, llama.cpp server, vLLM, `OpenAI` itself).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatBackend, CompletionParams};
use crate::context::Turn;
use crate::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat client for an OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Turn],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiClient {
    /// Create a client for `base_url` (e.g. `http://127.0.0.1:1234/v1`)
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            model: model.into(),
        })
    }

    /// Send a bearer token with every request
    #[must_use]
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    /// Use `model` for completions
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Model used for completions
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Models the server advertises
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the response is malformed
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let response = self.authorized(self.client.get(&url)).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(Error::Backend(format!("model listing returned {status}")));
        }

        let list: ModelList = response
            .json()
            .await
            .map_err(|e| Error::Backend(format!("malformed model list: {e}")))?;

        Ok(list.data.into_iter().map(|m| m.id).collect())
    }

    /// Pick the first advertised model, falling back to the configured one
    pub async fn detect_model(&self) -> String {
        match self.list_models().await {
            Ok(models) => {
                if let Some(first) = models.into_iter().next() {
                    tracing::info!(model = %first, "detected active model");
                    return first;
                }
                tracing::warn!(fallback = %self.model, "server advertises no models");
            }
            Err(e) => {
                tracing::warn!(error = %e, fallback = %self.model, "model detection failed");
            }
        }
        self.model.clone()
    }
}

/// Pull the assistant text out of a completion response
fn extract_reply(response: ChatCompletionResponse) -> Result<String> {
    response
        .choices
        .and_then(|choices| choices.into_iter().next())
        .and_then(|choice| choice.message)
        .and_then(|message| message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| Error::Backend("completion response has no content".to_string()))
}

#[async_trait]
impl ChatBackend for OpenAiClient {
    async fn complete(&self, messages: &[Turn], params: CompletionParams) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens: params.max_tokens,
            temperature: params.temperature,
        };

        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            max_tokens = params.max_tokens,
            "requesting chat completion"
        );

        let response = self
            .authorized(self.client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("completion request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Backend(format!("completion returned {status}: {text}")));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::Backend(format!("malformed completion response: {e}")))?;

        extract_reply(parsed)
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_lowercase_roles() {
        let messages = vec![Turn::system("be nice"), Turn::user("hi")];
        let body = ChatCompletionRequest {
            model: "local-model",
            messages: &messages,
            max_tokens: 300,
            temperature: 0.8,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "local-model");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hi");
        assert_eq!(json["max_tokens"], 300);
    }

    #[test]
    fn reply_is_trimmed() {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"  hello \n"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_reply(parsed).unwrap(), "hello");
    }

    #[test]
    fn empty_choices_is_backend_error() {
        let parsed: ChatCompletionResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(matches!(extract_reply(parsed), Err(Error::Backend(_))));
    }

    #[test]
    fn blank_content_is_backend_error() {
        let parsed: ChatCompletionResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"role":"assistant","content":"  \n "}}]}"#,
        )
        .unwrap();
        assert!(matches!(extract_reply(parsed), Err(Error::Backend(_))));
    }

    #[test]
    fn base_url_trailing_slash_is_dropped() {
        let client = OpenAiClient::new("http://127.0.0.1:1234/v1/", "m").unwrap();
        assert_eq!(client.base_url, "http://127.0.0.1:1234/v1");
        assert_eq!(client.model(), "m");
    }

    #[test]
    fn empty_api_key_is_ignored() {
        let client = OpenAiClient::new("http://x", "m")
            .unwrap()
            .with_api_key(Some(String::new()));
        assert!(client.api_key.is_none());
    }
}
