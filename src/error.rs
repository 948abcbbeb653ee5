//! Error types for the Signal relay

use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Signal relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Daemon could not be started or connected to
    #[error("startup error: {0}")]
    Startup(String),

    /// Socket connection to the daemon failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected frame
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Conversational backend error
    #[error("backend error: {0}")]
    Backend(String),

    /// Image generation error
    #[error("image error: {0}")]
    Image(String),

    /// Persona not found or invalid
    #[error("persona error: {0}")]
    Persona(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
