//! JSON-RPC line framing for the signal-cli socket
//!
//! Every frame is one JSON object terminated by `\n`.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::outbox::SendTask;
use crate::Result;

/// Upper bound on a single unterminated frame
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Accumulates raw socket bytes and yields complete lines
///
/// Bytes are buffered undecoded so multi-byte characters split across reads
/// are reassembled before UTF-8 validation.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl LineBuffer {
    /// Create an empty buffer capped at [`MAX_FRAME_BYTES`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with a custom cap on unterminated lines
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Append freshly read bytes
    ///
    /// If the unterminated tail grows past the limit it is discarded.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.limit && !self.buf.contains(&b'\n') {
            tracing::warn!(
                bytes = self.buf.len(),
                "discarding oversized unterminated frame"
            );
            self.buf.clear();
        }
    }

    /// Remove and return the next complete line, without its delimiter
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    /// Number of buffered bytes not yet returned
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Monotonic request id source, one per transport
#[derive(Debug)]
pub struct RequestIds {
    next: u64,
}

impl Default for RequestIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl RequestIds {
    /// Id the next call to [`next_id`](Self::next_id) will return
    #[must_use]
    pub const fn peek(&self) -> u64 {
        self.next
    }

    /// Hand out the next id
    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Outbound JSON-RPC request
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: SendParams<'a>,
    id: u64,
}

/// Parameters for the `send` method
#[derive(Debug, Serialize)]
pub struct SendParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    number: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    recipient: Option<&'a str>,
    message: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<String>,
}

/// Whether the identifier has phone-number shape
#[must_use]
pub fn is_phone_number(identifier: &str) -> bool {
    identifier.starts_with('+')
}

impl<'a> RpcRequest<'a> {
    /// Build a `send` request for a task
    #[must_use]
    pub fn send(task: &'a SendTask, id: u64) -> Self {
        let (number, recipient) = if is_phone_number(&task.recipient) {
            (Some(task.recipient.as_str()), None)
        } else {
            (None, Some(task.recipient.as_str()))
        };

        Self {
            jsonrpc: "2.0",
            method: "send",
            params: SendParams {
                number,
                recipient,
                message: &task.body,
                attachments: task
                    .attachments
                    .iter()
                    .map(|p| absolute_path(p).display().to_string())
                    .collect(),
            },
            id,
        }
    }

    /// Serialize to one newline-terminated frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_frame(&self) -> Result<Vec<u8>> {
        let mut frame = serde_json::to_vec(self)?;
        frame.push(b'\n');
        Ok(frame)
    }
}

/// Resolve a path against the current directory without touching the filesystem
fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
}
