//! Inbound frames from the signal-cli daemon
//!
//! signal-cli pushes `receive` notifications whose `params.envelope` carries
//! one of `dataMessage`, `syncMessage`, `typingMessage`, `receiptMessage`, ...
//! Only the first two are of interest.

use serde::Deserialize;

use crate::{Error, Result};

/// A decoded frame
#[derive(Debug)]
pub enum Frame {
    /// Incoming message notification
    Receive(Envelope),
    /// Reply to one of our requests
    Response {
        /// Request id the daemon is answering
        id: Option<serde_json::Value>,
        /// Error, if the request failed
        error: Option<RpcError>,
    },
    /// Any other notification
    Other(Option<String>),
}

/// JSON-RPC error object
#[derive(Debug, Clone, Deserialize)]
pub struct RpcError {
    /// Error code
    pub code: Option<i64>,
    /// Human-readable message
    pub message: Option<String>,
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (code {})",
            self.message.as_deref().unwrap_or("unknown error"),
            self.code.map_or_else(|| "?".to_string(), |c| c.to_string())
        )
    }
}

/// Raw JSON-RPC object as it appears on the wire
#[derive(Debug, Deserialize)]
struct RawFrame {
    method: Option<String>,
    params: Option<serde_json::Value>,
    id: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RawParams {
    envelope: Option<RawEnvelope>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    source: Option<String>,
    source_number: Option<String>,
    source_uuid: Option<String>,
    data_message: Option<RawDataMessage>,
    sync_message: Option<RawSyncMessage>,
    typing_message: Option<serde_json::Value>,
    receipt_message: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawDataMessage {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSyncMessage {
    sent_message: Option<RawSentMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSentMessage {
    message: Option<String>,
    destination: Option<String>,
    destination_number: Option<String>,
    destination_uuid: Option<String>,
}

/// One inbound message event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Stable account id of the sender
    pub source_uuid: Option<String>,
    /// Phone number of the sender, when shared
    pub source_number: Option<String>,
    /// What kind of event this is
    pub kind: EnvelopeKind,
}

/// Discriminant of an envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Message sent directly to the bot
    Direct {
        /// Message text
        body: Option<String>,
    },
    /// Synced copy of a message sent from the bot's own account
    SentCopy {
        /// Message text
        body: Option<String>,
        /// Every identifier the copy was addressed to
        destinations: Vec<String>,
    },
    /// Typing indicator, receipt, or anything else
    Ignored(&'static str),
}

impl Envelope {
    /// Identifier used for replies and conversation keys
    ///
    /// Prefers the stable account id over the phone number.
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.source_uuid
            .as_deref()
            .or(self.source_number.as_deref())
    }

    /// Whether the envelope originates from `identity`
    #[must_use]
    pub fn is_from(&self, identity: &str) -> bool {
        self.source_uuid.as_deref() == Some(identity)
            || self.source_number.as_deref() == Some(identity)
    }

    /// Message text, if any
    #[must_use]
    pub fn body(&self) -> Option<&str> {
        match &self.kind {
            EnvelopeKind::Direct { body } | EnvelopeKind::SentCopy { body, .. } => {
                body.as_deref()
            }
            EnvelopeKind::Ignored(_) => None,
        }
    }
}

impl EnvelopeKind {
    /// Whether a synced copy was addressed to `identity`
    #[must_use]
    pub fn addressed_to(&self, identity: &str) -> bool {
        match self {
            Self::SentCopy { destinations, .. } => destinations.iter().any(|d| d == identity),
            _ => false,
        }
    }
}

impl From<RawEnvelope> for Envelope {
    fn from(raw: RawEnvelope) -> Self {
        let kind = if let Some(data) = raw.data_message {
            EnvelopeKind::Direct { body: data.message }
        } else if let Some(sync) = raw.sync_message {
            match sync.sent_message {
                Some(sent) => EnvelopeKind::SentCopy {
                    body: sent.message,
                    destinations: [sent.destination, sent.destination_number, sent.destination_uuid]
                        .into_iter()
                        .flatten()
                        .collect(),
                },
                None => EnvelopeKind::Ignored("sync"),
            }
        } else if raw.typing_message.is_some() {
            EnvelopeKind::Ignored("typing")
        } else if raw.receipt_message.is_some() {
            EnvelopeKind::Ignored("receipt")
        } else {
            EnvelopeKind::Ignored("other")
        };

        Self {
            source_uuid: raw.source_uuid,
            source_number: raw.source_number.or(raw.source),
            kind,
        }
    }
}

/// Parse one line from the daemon
///
/// # Errors
///
/// Returns error if the line is not a JSON object
pub fn parse_frame(line: &str) -> Result<Frame> {
    let raw: RawFrame = serde_json::from_str(line)
        .map_err(|e| Error::Protocol(format!("malformed frame: {e}")))?;

    if raw.method.as_deref() == Some("receive") {
        let params: RawParams = serde_json::from_value(raw.params.unwrap_or_default())
            .map_err(|e| Error::Protocol(format!("malformed receive params: {e}")))?;
        let envelope = params
            .envelope
            .ok_or_else(|| Error::Protocol("receive notification without envelope".to_string()))?;
        return Ok(Frame::Receive(envelope.into()));
    }

    if raw.method.is_none() && (raw.result.is_some() || raw.error.is_some()) {
        return Ok(Frame::Response {
            id: raw.id,
            error: raw.error,
        });
    }

    Ok(Frame::Other(raw.method))
}
