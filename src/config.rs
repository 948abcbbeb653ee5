//! Configuration management for the Signal relay
//!
//! Everything comes from environment variables; the CLI overrides a few of
//! them. [`Config::from_lookup`] takes any key lookup so tests never touch
//! the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::context::CompactionConfig;
use crate::providers::ForgeSettings;
use crate::signal::DaemonSpec;
use crate::{Error, Result};

const DEFAULT_SIGNAL_CLI: &str = "signal-cli";
const DEFAULT_DAEMON_ADDRESS: &str = "127.0.0.1:7583";
const DEFAULT_LLM_URL: &str = "http://127.0.0.1:1234/v1";
const DEFAULT_LLM_MODEL: &str = "local-model";

/// Relay configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// signal-cli daemon settings
    pub signal: SignalConfig,

    /// Chat backend settings
    pub llm: LlmConfig,

    /// Image backend settings; `None` disables image commands
    pub forge: Option<ForgeConfig>,

    /// Persona TOML file; the built-in persona is used when unset
    pub persona_file: Option<PathBuf>,

    /// Conversation size limits
    pub context: CompactionConfig,
}

/// signal-cli daemon settings
#[derive(Debug, Clone)]
pub struct SignalConfig {
    /// signal-cli executable
    pub cli_path: PathBuf,

    /// Registered account the bot runs as (phone number)
    pub account: String,

    /// `host:port` the daemon listens on
    pub daemon_address: String,

    /// How long the daemon gets to come up before the liveness check
    pub startup_grace: Duration,
}

/// OpenAI-compatible chat backend settings
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Base URL, including the `/v1` suffix
    pub api_url: String,

    /// Model used when detection fails
    pub model: String,

    /// Bearer token, for hosted endpoints
    pub api_key: Option<String>,
}

/// Forge web UI settings
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    /// Base URL of the web UI
    pub api_url: String,

    /// Where generated images are written
    pub image_dir: PathBuf,

    /// txt2img parameters
    pub settings: ForgeSettings,
}

/// Default image directory (`~/.local/share/signal-relay/images` on Linux)
#[must_use]
pub fn default_image_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "omni", "signal-relay")
        .map_or_else(|| PathBuf::from("images"), |d| d.data_dir().join("images"))
}

/// Read an optional non-empty variable
fn var<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

/// Parse a variable, keeping `default` when unset or invalid
fn parsed<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match var(lookup, key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparsable value");
            default
        }),
        None => default,
    }
}

fn flag<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    var(lookup, key).map_or(default, |v| {
        matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
    })
}

impl ForgeSettings {
    /// Read `FORGE_*` overrides on top of the defaults
    fn from_lookup<F>(lookup: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        Self {
            negative_prompt: var(lookup, "FORGE_NEGATIVE_PROMPT").unwrap_or(d.negative_prompt),
            width: parsed(lookup, "FORGE_WIDTH", d.width),
            height: parsed(lookup, "FORGE_HEIGHT", d.height),
            cfg_scale: parsed(lookup, "FORGE_CFG_SCALE", d.cfg_scale),
            steps: parsed(lookup, "FORGE_STEPS", d.steps),
            sampler: var(lookup, "FORGE_SAMPLER").unwrap_or(d.sampler),
            scheduler: var(lookup, "FORGE_SCHEDULER").unwrap_or(d.scheduler),
            seed: parsed(lookup, "FORGE_SEED", d.seed),
            hires_enabled: flag(lookup, "FORGE_HIRES_ENABLED", d.hires_enabled),
            hires_denoising: parsed(lookup, "FORGE_HIRES_DENOISING", d.hires_denoising),
            hires_upscaler: var(lookup, "FORGE_HIRES_UPSCALER").unwrap_or(d.hires_upscaler),
            hires_scale: parsed(lookup, "FORGE_HIRES_SCALE", d.hires_scale),
            hires_steps: parsed(lookup, "FORGE_HIRES_STEPS", d.hires_steps),
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let signal = SignalConfig {
            cli_path: var(&lookup, "SIGNAL_CLI_PATH")
                .map_or_else(|| PathBuf::from(DEFAULT_SIGNAL_CLI), PathBuf::from),
            account: var(&lookup, "SIGNAL_ACCOUNT")
                .or_else(|| var(&lookup, "YOUR_SIGNAL_NUMBER"))
                .unwrap_or_default(),
            daemon_address: var(&lookup, "SIGNAL_DAEMON_ADDRESS")
                .unwrap_or_else(|| DEFAULT_DAEMON_ADDRESS.to_string()),
            startup_grace: Duration::from_secs(parsed(
                &lookup,
                "SIGNAL_STARTUP_GRACE_SECS",
                5,
            )),
        };

        let llm = LlmConfig {
            api_url: var(&lookup, "LLM_API_URL")
                .or_else(|| var(&lookup, "API_URL"))
                .unwrap_or_else(|| DEFAULT_LLM_URL.to_string()),
            model: var(&lookup, "LLM_MODEL")
                .or_else(|| var(&lookup, "MODEL_IDENTIFIER"))
                .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
            api_key: var(&lookup, "LLM_API_KEY"),
        };

        let forge = var(&lookup, "FORGE_API_URL").map(|api_url| ForgeConfig {
            api_url,
            image_dir: var(&lookup, "IMAGE_OUTPUT_DIR")
                .map_or_else(default_image_dir, PathBuf::from),
            settings: ForgeSettings::from_lookup(&lookup),
        });

        let defaults = CompactionConfig::default();
        let context = CompactionConfig {
            token_threshold: parsed(&lookup, "CONTEXT_TOKEN_THRESHOLD", defaults.token_threshold),
            max_messages: parsed(&lookup, "CONTEXT_MAX_MESSAGES", defaults.max_messages),
            ..defaults
        };

        Self {
            signal,
            llm,
            forge,
            persona_file: var(&lookup, "PERSONA_FILE").map(PathBuf::from),
            context,
        }
    }

    /// Check the configuration before anything is started
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.signal.account.trim().is_empty() {
            return Err(Error::Config(
                "no Signal account configured (set SIGNAL_ACCOUNT or --account)".to_string(),
            ));
        }

        validate_address(&self.signal.daemon_address)?;
        validate_url("LLM_API_URL", &self.llm.api_url)?;
        if let Some(forge) = &self.forge {
            validate_url("FORGE_API_URL", &forge.api_url)?;
        }

        if self.context.token_threshold == 0 {
            return Err(Error::Config(
                "CONTEXT_TOKEN_THRESHOLD must be greater than 0".to_string(),
            ));
        }
        if self.context.max_messages == 0 {
            return Err(Error::Config(
                "CONTEXT_MAX_MESSAGES must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Launch description for the signal-cli daemon
    #[must_use]
    pub fn daemon_spec(&self) -> DaemonSpec {
        DaemonSpec::signal_cli(
            &self.signal.cli_path,
            &self.signal.account,
            &self.signal.daemon_address,
        )
        .with_grace_period(self.signal.startup_grace)
    }
}

fn validate_address(address: &str) -> Result<()> {
    let invalid = || {
        Error::Config(format!(
            "SIGNAL_DAEMON_ADDRESS must be host:port, got {address:?}"
        ))
    };
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || !port.parse::<u16>().is_ok_and(|p| p != 0) {
        return Err(invalid());
    }
    Ok(())
}

fn validate_url(key: &str, value: &str) -> Result<()> {
    let url = url::Url::parse(value)
        .map_err(|e| Error::Config(format!("{key} is not a valid URL ({value}): {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::Config(format!(
            "{key} must be an http(s) URL, got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let c = config(&[]);
        assert_eq!(c.signal.cli_path, PathBuf::from("signal-cli"));
        assert_eq!(c.signal.daemon_address, "127.0.0.1:7583");
        assert_eq!(c.signal.startup_grace, Duration::from_secs(5));
        assert_eq!(c.llm.api_url, "http://127.0.0.1:1234/v1");
        assert_eq!(c.llm.model, "local-model");
        assert!(c.forge.is_none());
        assert_eq!(c.context.token_threshold, 3000);
        assert_eq!(c.context.max_messages, 50);
    }

    #[test]
    fn legacy_names_are_fallbacks() {
        let c = config(&[
            ("YOUR_SIGNAL_NUMBER", "+15550000000"),
            ("API_URL", "http://10.0.0.2:1234/v1"),
            ("MODEL_IDENTIFIER", "mistral"),
        ]);
        assert_eq!(c.signal.account, "+15550000000");
        assert_eq!(c.llm.api_url, "http://10.0.0.2:1234/v1");
        assert_eq!(c.llm.model, "mistral");

        let c = config(&[
            ("YOUR_SIGNAL_NUMBER", "+15550000000"),
            ("SIGNAL_ACCOUNT", "+15551111111"),
        ]);
        assert_eq!(c.signal.account, "+15551111111");
    }

    #[test]
    fn forge_settings_are_read() {
        let c = config(&[
            ("FORGE_API_URL", "http://127.0.0.1:7860"),
            ("IMAGE_OUTPUT_DIR", "/tmp/relay-images"),
            ("FORGE_STEPS", "40"),
            ("FORGE_HIRES_ENABLED", "true"),
            ("FORGE_SAMPLER", "DPM++ 2M"),
        ]);
        let forge = c.forge.unwrap();
        assert_eq!(forge.image_dir, PathBuf::from("/tmp/relay-images"));
        assert_eq!(forge.settings.steps, 40);
        assert!(forge.settings.hires_enabled);
        assert_eq!(forge.settings.sampler, "DPM++ 2M");
        assert_eq!(forge.settings.width, ForgeSettings::default().width);
    }

    #[test]
    fn unparsable_numbers_keep_defaults() {
        let c = config(&[
            ("CONTEXT_TOKEN_THRESHOLD", "lots"),
            ("SIGNAL_STARTUP_GRACE_SECS", "-3"),
        ]);
        assert_eq!(c.context.token_threshold, 3000);
        assert_eq!(c.signal.startup_grace, Duration::from_secs(5));
    }

    #[test]
    fn validate_requires_account() {
        let err = config(&[]).validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(config(&[("SIGNAL_ACCOUNT", "+1555")]).validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_address() {
        for address in ["7583", ":7583", "localhost:", "localhost:99999", "host:0"] {
            let c = config(&[("SIGNAL_ACCOUNT", "+1"), ("SIGNAL_DAEMON_ADDRESS", address)]);
            assert!(c.validate().is_err(), "{address} should be rejected");
        }
        let c = config(&[("SIGNAL_ACCOUNT", "+1"), ("SIGNAL_DAEMON_ADDRESS", "localhost:7583")]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_urls() {
        let c = config(&[("SIGNAL_ACCOUNT", "+1"), ("LLM_API_URL", "not a url")]);
        assert!(c.validate().is_err());

        let c = config(&[("SIGNAL_ACCOUNT", "+1"), ("FORGE_API_URL", "ftp://host")]);
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let c = config(&[("SIGNAL_ACCOUNT", "+1"), ("CONTEXT_MAX_MESSAGES", "0")]);
        assert!(c.validate().is_err());
    }

    #[test]
    fn daemon_spec_uses_signal_settings() {
        let c = config(&[
            ("SIGNAL_ACCOUNT", "+15550000000"),
            ("SIGNAL_CLI_PATH", "/opt/signal-cli/bin/signal-cli"),
            ("SIGNAL_STARTUP_GRACE_SECS", "2"),
        ]);
        let spec = c.daemon_spec();
        assert_eq!(spec.program, PathBuf::from("/opt/signal-cli/bin/signal-cli"));
        assert_eq!(
            spec.args,
            ["-u", "+15550000000", "daemon", "--tcp", "127.0.0.1:7583"]
        );
        assert_eq!(spec.grace_period, Duration::from_secs(2));
    }
}
