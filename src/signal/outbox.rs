//! Outbound send queue
//!
//! The router produces [`SendTask`]s and the writer loop consumes them. The
//! queue is closed by a single poison pill ([`Outbound::Close`]): everything
//! enqueued before the pill is still delivered, nothing after it is.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

/// A queued outbound message awaiting serialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTask {
    /// Recipient identifier (phone number or opaque account id)
    pub recipient: String,
    /// Message text (may be empty for attachment-only messages)
    pub body: String,
    /// Files to attach
    pub attachments: Vec<PathBuf>,
}

impl SendTask {
    /// Create a text-only task
    #[must_use]
    pub fn text(recipient: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            body: body.into(),
            attachments: Vec::new(),
        }
    }

    /// Attach files to the task
    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<PathBuf>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Item travelling through the queue
#[derive(Debug)]
pub enum Outbound {
    /// Deliver this task
    Send(SendTask),
    /// Terminate the writer loop
    Close,
}

/// Result of a bounded wait on the queue
#[derive(Debug)]
pub enum Dequeued {
    /// A task is ready
    Task(SendTask),
    /// The poison pill was received or every producer is gone
    Closed,
    /// Nothing arrived within the wait
    Empty,
}

/// Producer handle, cheap to clone
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

/// Consumer handle owned by the writer loop
#[derive(Debug)]
pub struct OutboxReceiver {
    rx: mpsc::UnboundedReceiver<Outbound>,
}

impl Outbox {
    /// Create a connected producer/consumer pair
    #[must_use]
    pub fn channel() -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, OutboxReceiver { rx })
    }

    /// Queue a task for delivery
    ///
    /// Returns `false` if the writer is gone and the task was dropped.
    pub fn push(&self, task: SendTask) -> bool {
        if self.tx.send(Outbound::Send(task)).is_err() {
            tracing::warn!("outbox closed, dropping outbound message");
            return false;
        }
        true
    }

    /// Queue a plain text reply
    pub fn push_text(&self, recipient: &str, body: impl Into<String>) -> bool {
        self.push(SendTask::text(recipient, body))
    }

    /// Queue the poison pill
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

impl OutboxReceiver {
    /// Wait up to `timeout` for the next item
    pub async fn next_within(&mut self, timeout: Duration) -> Dequeued {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(Outbound::Send(task))) => Dequeued::Task(task),
            Ok(Some(Outbound::Close) | None) => Dequeued::Closed,
            Err(_) => Dequeued::Empty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.push_text("+1", "first");
        outbox.push_text("+1", "second");

        let Dequeued::Task(a) = rx.next_within(WAIT).await else {
            panic!("expected task");
        };
        let Dequeued::Task(b) = rx.next_within(WAIT).await else {
            panic!("expected task");
        };
        assert_eq!(a.body, "first");
        assert_eq!(b.body, "second");
    }

    #[tokio::test]
    async fn close_is_observed_after_pending_tasks() {
        let (outbox, mut rx) = Outbox::channel();
        outbox.push_text("+1", "pending");
        outbox.close();
        outbox.push_text("+1", "late");

        assert!(matches!(rx.next_within(WAIT).await, Dequeued::Task(_)));
        assert!(matches!(rx.next_within(WAIT).await, Dequeued::Closed));
    }

    #[tokio::test]
    async fn empty_queue_times_out() {
        let (_outbox, mut rx) = Outbox::channel();
        assert!(matches!(rx.next_within(WAIT).await, Dequeued::Empty));
    }

    #[tokio::test]
    async fn dropped_producers_close_queue() {
        let (outbox, mut rx) = Outbox::channel();
        drop(outbox);
        assert!(matches!(rx.next_within(WAIT).await, Dequeued::Closed));
    }

    #[test]
    fn push_after_receiver_dropped_reports_failure() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);
        assert!(!outbox.push_text("+1", "lost"));
    }
}
