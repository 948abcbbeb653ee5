//! Signal Relay - bridges a signal-cli daemon to conversational AI backends
//!
//! This library provides the core functionality for the relay:
//! - Supervision of the external `signal-cli` daemon process
//! - Newline-framed JSON-RPC transport over the daemon's TCP socket
//! - Message routing and command dispatch
//! - Per-sender conversation context with automatic summarization
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              signal-cli daemon (child)               │
//! └────────────────────┬────────────────────────────────┘
//!                      │ JSON-RPC lines over TCP
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Gateway Session                     │
//! │   Reader  │  Router  │  Conversations  │  Writer    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Backends                          │
//! │   Chat completions  │  Image generation             │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod persona;
pub mod providers;
pub mod router;
pub mod session;
pub mod signal;

pub use config::Config;
pub use context::{CompactionConfig, Conversation, ConversationManager, Role, Turn};
pub use error::{Error, Result};
pub use persona::Persona;
pub use providers::{ChatBackend, CompletionParams, ImageBackend};
pub use router::{Command, MessageRouter};
pub use session::GatewaySession;
pub use signal::{
    DaemonSpec, DaemonState, DaemonSupervisor, Envelope, EnvelopeKind, Outbox, SendTask,
    Transport,
};
