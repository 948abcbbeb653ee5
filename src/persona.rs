//! Persona configuration
//!
//! A persona is the identity the assistant speaks as. Its system prompt
//! seeds every conversation. Personas are loaded from TOML:
//!
//! ```toml
//! [identity]
//! name = "Orin"
//! tagline = "Friendly Signal companion"
//!
//! [personality]
//! system_prompt = "You are Orin, a concise and friendly assistant."
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant chatting with people over \
     Signal. Keep replies short and conversational, and answer in the language you are \
     addressed in.";

/// Identity the assistant speaks as
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Persona {
    /// Core identity
    pub identity: Identity,

    /// Behavior and communication style
    #[serde(default)]
    pub personality: Personality,
}

/// Core identity of the entity
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Identity {
    /// Display name
    pub name: String,

    /// Short descriptive phrase
    pub tagline: Option<String>,
}

/// Behavior and communication style
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Personality {
    /// System prompt seeding every conversation
    pub system_prompt: Option<String>,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            identity: Identity {
                name: "Assistant".to_string(),
                tagline: None,
            },
            personality: Personality {
                system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            },
        }
    }
}

impl Persona {
    /// Parse a persona from TOML
    ///
    /// # Errors
    ///
    /// Returns error if the TOML is invalid or the system prompt is blank
    pub fn from_toml(content: &str) -> Result<Self> {
        let persona: Self = toml::from_str(content)?;
        persona.validate()?;
        Ok(persona)
    }

    /// Load a persona file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Persona(format!("failed to read {}: {e}", path.display()))
        })?;
        let persona = Self::from_toml(&content)?;
        tracing::info!(persona = persona.name(), path = %path.display(), "loaded persona");
        Ok(persona)
    }

    fn validate(&self) -> Result<()> {
        if self.identity.name.trim().is_empty() {
            return Err(Error::Persona("identity.name must not be empty".to_string()));
        }
        if self
            .personality
            .system_prompt
            .as_deref()
            .is_some_and(|p| p.trim().is_empty())
        {
            return Err(Error::Persona(
                "personality.system_prompt must not be blank".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Get the system prompt, falling back to the built-in one
    #[must_use]
    pub fn system_prompt(&self) -> &str {
        self.personality
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT)
    }
}
