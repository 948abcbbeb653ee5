//! Stable Diffusion Forge image generation
//!
//! Talks to the Gradio queue behind the Forge web UI:
//! 1. register a task id at `/internal/progress`
//! 2. submit the positional txt2img payload to `/queue/join`
//! 3. follow the `/queue/data` event stream until `process_completed`
//! 4. download (or decode) the first output image into the image directory

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt;
use serde_json::{Value, json};

use super::ImageBackend;
use crate::signal::rpc::LineBuffer;
use crate::{Error, Result};

const PROGRESS_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_TIMEOUT: Duration = Duration::from_secs(180);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Inline images arrive as a single event line
const MAX_EVENT_BYTES: usize = 64 * 1024 * 1024;

const QUALITY_TAGS: &str = "best quality, dynamic lighting";
const INLINE_PNG_PREFIX: &str = "data:image/png;base64,";
const TXT2IMG_FN_INDEX: u32 = 256;
const TXT2IMG_TRIGGER_ID: u32 = 16;

/// txt2img parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ForgeSettings {
    /// Things the image should not contain
    pub negative_prompt: String,
    /// Output width in pixels
    pub width: u32,
    /// Output height in pixels
    pub height: u32,
    /// Classifier-free guidance scale
    pub cfg_scale: f64,
    /// Sampling steps
    pub steps: u32,
    /// Sampler name as shown in the web UI
    pub sampler: String,
    /// Noise schedule
    pub scheduler: String,
    /// `-1` picks a random seed
    pub seed: i64,
    /// Run the hires-fix second pass
    pub hires_enabled: bool,
    /// Denoising strength of the second pass
    pub hires_denoising: f64,
    /// Upscaler used by the second pass
    pub hires_upscaler: String,
    /// Upscale factor
    pub hires_scale: f64,
    /// Second pass steps, 0 reuses `steps`
    pub hires_steps: u32,
}

impl Default for ForgeSettings {
    fn default() -> Self {
        Self {
            negative_prompt: "lowres, bad anatomy, bad hands, text, error, missing fingers, \
                              worst quality, low quality, jpeg artifacts, signature, watermark, blurry"
                .to_string(),
            width: 896,
            height: 1152,
            cfg_scale: 7.0,
            steps: 25,
            sampler: "Euler a".to_string(),
            scheduler: "Automatic".to_string(),
            seed: -1,
            hires_enabled: false,
            hires_denoising: 0.4,
            hires_upscaler: "Latent".to_string(),
            hires_scale: 1.5,
            hires_steps: 0,
        }
    }
}

/// Where the finished image lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    /// Download from this URL (may be relative to the Forge base)
    Url(String),
    /// Base64-encoded PNG carried in the event itself
    Inline(String),
}

/// Forge web UI client
#[derive(Debug, Clone)]
pub struct ForgeClient {
    client: reqwest::Client,
    base_url: String,
    output_dir: PathBuf,
    settings: ForgeSettings,
}

impl ForgeClient {
    /// Create a client writing images into `output_dir`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(
        base_url: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        settings: ForgeSettings,
    ) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            output_dir: output_dir.into(),
            settings,
        })
    }

    /// Directory generated images are written to
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    async fn register_task(&self, task_id: &str) -> Result<()> {
        self.client
            .post(format!("{}/internal/progress", self.base_url))
            .timeout(PROGRESS_TIMEOUT)
            .json(&json!({
                "id_task": task_id,
                "id_live_preview": -1,
                "live_preview": false,
            }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Image(format!("task registration failed: {e}")))?;
        Ok(())
    }

    async fn join_queue(&self, task_id: &str, session_hash: &str, prompt: &str) -> Result<()> {
        let data = txt2img_payload(task_id, &quality_prompt(prompt), &self.settings);
        self.client
            .post(format!("{}/queue/join", self.base_url))
            .timeout(JOIN_TIMEOUT)
            .json(&json!({
                "data": data,
                "event_data": null,
                "fn_index": TXT2IMG_FN_INDEX,
                "trigger_id": TXT2IMG_TRIGGER_ID,
                "session_hash": session_hash,
            }))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Image(format!("queue join failed: {e}")))?;
        Ok(())
    }

    async fn await_result(&self, session_hash: &str) -> Result<ImageRef> {
        let response = self
            .client
            .get(format!("{}/queue/data", self.base_url))
            .query(&[("session_hash", session_hash)])
            .timeout(STREAM_TIMEOUT)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| Error::Image(format!("event stream failed: {e}")))?;

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::with_limit(MAX_EVENT_BYTES);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Image(format!("event stream failed: {e}")))?;
            lines.extend(&chunk);

            while let Some(line) = lines.next_line() {
                let Some(event) = parse_event(&line) else {
                    continue;
                };
                match event.get("msg").and_then(Value::as_str) {
                    Some("process_completed") => {
                        if event.get("success").and_then(Value::as_bool) == Some(false) {
                            return Err(Error::Image("generation reported failure".to_string()));
                        }
                        return extract_image_ref(&event).ok_or_else(|| {
                            Error::Image("completed without an image".to_string())
                        });
                    }
                    Some(msg) => tracing::trace!(msg, "forge event"),
                    None => {}
                }
            }
        }

        Err(Error::Image("event stream ended before completion".to_string()))
    }

    async fn fetch(&self, image: &ImageRef) -> Result<Vec<u8>> {
        match image {
            ImageRef::Inline(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| Error::Image(format!("invalid inline image: {e}"))),
            ImageRef::Url(url) => {
                let url = resolve_url(&self.base_url, url);
                let bytes = self
                    .client
                    .get(&url)
                    .timeout(DOWNLOAD_TIMEOUT)
                    .send()
                    .await
                    .and_then(reqwest::Response::error_for_status)
                    .map_err(|e| Error::Image(format!("image download failed: {e}")))?
                    .bytes()
                    .await
                    .map_err(|e| Error::Image(format!("image download failed: {e}")))?;
                Ok(bytes.to_vec())
            }
        }
    }

    async fn store(&self, bytes: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self
            .output_dir
            .join(format!("forge-{}.png", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

#[async_trait]
impl ImageBackend for ForgeClient {
    async fn generate(&self, prompt: &str) -> Result<PathBuf> {
        let task_id = format!("task({})", random_token());
        let session_hash = random_token();

        tracing::info!(task = %task_id, "submitting image generation");

        self.register_task(&task_id).await?;
        self.join_queue(&task_id, &session_hash, prompt).await?;
        let image = self.await_result(&session_hash).await?;
        let bytes = self.fetch(&image).await?;
        let path = self.store(&bytes).await?;

        tracing::info!(task = %task_id, path = %path.display(), bytes = bytes.len(), "image generated");
        Ok(path)
    }

    fn name(&self) -> &'static str {
        "forge"
    }
}

/// Decode one `data: {...}` server-sent event line
fn parse_event(line: &[u8]) -> Option<Value> {
    let line = std::str::from_utf8(line).ok()?;
    let payload = line.strip_prefix("data:")?.trim_start();
    serde_json::from_str(payload).ok()
}

/// Locate the first output image of a `process_completed` event
#[must_use]
pub fn extract_image_ref(event: &Value) -> Option<ImageRef> {
    let first = event
        .get("output")?
        .get("data")?
        .as_array()?
        .first()?
        .as_array()?
        .first()?;

    if let Some(encoded) = first.as_str() {
        return encoded
            .strip_prefix(INLINE_PNG_PREFIX)
            .map(|b64| ImageRef::Inline(b64.to_string()));
    }

    first
        .get("image")
        .and_then(|image| image.get("url"))
        .or_else(|| first.get("url"))
        .and_then(Value::as_str)
        .map(|url| ImageRef::Url(url.to_string()))
}

fn resolve_url(base: &str, url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if url.starts_with('/') {
        format!("{base}{url}")
    } else {
        format!("{base}/{url}")
    }
}

fn quality_prompt(prompt: &str) -> String {
    let prompt = prompt.trim().trim_start_matches([',', ' ']);
    if prompt.is_empty() {
        QUALITY_TAGS.to_string()
    } else {
        format!("{QUALITY_TAGS}, {prompt}")
    }
}

/// 15 lowercase alphanumerics
fn random_token() -> String {
    let mut token = uuid::Uuid::new_v4().simple().to_string();
    token.truncate(15);
    token
}

/// Positional argument list for the txt2img Gradio function
///
/// Order and types must match what the web UI registers for `fn_index` 256.
fn txt2img_payload(task_id: &str, prompt: &str, s: &ForgeSettings) -> Vec<Value> {
    let generation = json!([
        task_id,
        prompt,
        s.negative_prompt,
        [],
        1,
        1,
        1.3,
        3.5,
        s.width,
        s.height,
        s.hires_enabled,
        s.hires_denoising,
        s.hires_scale,
        s.hires_upscaler,
        s.hires_steps,
        0,
        0,
        "Use same checkpoint",
        ["Use same choices"],
        "Use same sampler",
        "Use same scheduler",
        "",
        "",
        s.cfg_scale,
        3.5,
        null,
        "None",
        s.steps,
        s.sampler,
        s.scheduler,
        false,
        "",
        0.8,
        s.seed,
        false,
        -1,
        0,
        0,
        0
    ]);
    let controlnet = json!([null, null, null, false, 7, 1, "Constant", 0, "Constant", 0, 1]);
    let adetailer = json!([
        "enable", "MEAN", "AD", 1, false, 1.01, 1.02, 0.99, 0.95, 0, 1, false, 0.5, 2, 1, false,
        3, 0, 0, 1, false, 3, 2, 0, 0.35, true, "bicubic", "bicubic"
    ]);
    let adetailer_tail = json!([
        false, 0, "anisotropic", 0, "reinhard", 100, 0, "subtract", 0, 0, "gaussian", "add", 0,
        100, 127, 0, "hard_clamp", 5, 0, "None", "None"
    ]);
    let extensions = json!([
        false, "MultiDiffusion", 768, 768, 64, 4, false, 1, false, false, false, false,
        "positive", "comma", 0, false, false, "start", "", false, "Seed", "", "", "Nothing", "",
        "", "Nothing", "", "", true, false, false, false, false, false, false, 0, false
    ]);

    [generation, controlnet, adetailer, adetailer_tail, extensions]
        .into_iter()
        .filter_map(|section| match section {
            Value::Array(items) => Some(items),
            _ => None,
        })
        .flatten()
        .collect()
}
