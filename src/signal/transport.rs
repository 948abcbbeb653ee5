//! Socket transport to the signal-cli daemon
//!
//! One TCP connection, split into independent halves: the reader task owns
//! the read half and drives routing, the writer task owns the write half and
//! drains the [`Outbox`](super::Outbox). A shared [`CancellationToken`] is the
//! shutdown flag; both loops wake on a short poll interval to observe it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::envelope::{Envelope, Frame, parse_frame};
use super::outbox::{Dequeued, OutboxReceiver};
use super::rpc::{LineBuffer, RequestIds, RpcRequest};
use crate::{Error, Result};

/// How long the reader waits for readability before re-checking shutdown
pub const READ_POLL: Duration = Duration::from_millis(100);

/// How long the writer waits on the queue before re-checking shutdown
pub const WRITE_POLL: Duration = Duration::from_millis(500);

/// Default socket connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 4096;

/// Receives parsed `receive` notifications from the reader loop
///
/// Called serially from the reader task, never concurrently.
#[async_trait]
pub trait EnvelopeHandler: Send {
    /// Handle one inbound envelope
    async fn handle(&mut self, envelope: Envelope);
}

/// An established connection to the daemon
pub struct Transport {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    peer: String,
}

/// Join handles for the running loops
pub struct TransportTasks {
    /// Reader loop
    pub reader: JoinHandle<()>,
    /// Writer loop, yields the number of frames written
    pub writer: JoinHandle<usize>,
}

impl Transport {
    /// Connect to the daemon's socket
    ///
    /// # Errors
    ///
    /// Returns error if the connection is refused or times out
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Startup(format!("timed out connecting to daemon at {address}")))?
            .map_err(|e| Error::Startup(format!("failed to connect to daemon at {address}: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| Error::Transport(format!("failed to configure socket: {e}")))?;
        let (reader, writer) = stream.into_split();

        tracing::info!(address, "connected to signal-cli daemon");
        Ok(Self {
            reader,
            writer,
            peer: address.to_string(),
        })
    }

    /// Address this transport is connected to
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Start the reader and writer loops
    pub fn spawn<H>(
        self,
        mut handler: H,
        mut outbox: OutboxReceiver,
        shutdown: CancellationToken,
    ) -> TransportTasks
    where
        H: EnvelopeHandler + 'static,
    {
        let reader_shutdown = shutdown.clone();
        let reader_half = self.reader;
        let reader = tokio::spawn(async move {
            read_loop(reader_half, &mut handler, &reader_shutdown, READ_POLL).await;
        });

        let mut writer_half = self.writer;
        let writer = tokio::spawn(async move {
            let written = write_loop(&mut writer_half, &mut outbox, &shutdown, WRITE_POLL).await;
            let _ = writer_half.shutdown().await;
            written
        });

        TransportTasks { reader, writer }
    }
}

/// Read frames until the peer disconnects or shutdown is requested
///
/// Raises the shutdown flag on exit so the writer follows.
pub async fn read_loop<R, H>(
    mut stream: R,
    handler: &mut H,
    shutdown: &CancellationToken,
    poll: Duration,
) where
    R: AsyncRead + Unpin,
    H: EnvelopeHandler + ?Sized,
{
    let mut buffer = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    'outer: while !shutdown.is_cancelled() {
        let read = match tokio::time::timeout(poll, stream.read(&mut chunk)).await {
            Err(_) => continue,
            Ok(read) => read,
        };

        let n = match read {
            Ok(0) => {
                tracing::warn!("daemon closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock
                ) =>
            {
                continue;
            }
            Err(e) => {
                tracing::error!(error = %e, "socket read failed");
                break;
            }
        };

        buffer.extend(&chunk[..n]);
        while let Some(line) = buffer.next_line() {
            if shutdown.is_cancelled() {
                break 'outer;
            }
            handle_line(&line, handler).await;
        }
    }

    shutdown.cancel();
    tracing::debug!("reader loop stopped");
}

async fn handle_line<H>(line: &[u8], handler: &mut H)
where
    H: EnvelopeHandler + ?Sized,
{
    let Ok(text) = std::str::from_utf8(line) else {
        tracing::warn!(bytes = line.len(), "dropping non-UTF-8 frame");
        return;
    };
    if text.trim().is_empty() {
        return;
    }

    match parse_frame(text) {
        Ok(Frame::Receive(envelope)) => handler.handle(envelope).await,
        Ok(Frame::Response {
            id,
            error: Some(error),
        }) => {
            tracing::warn!(id = ?id, error = %error, "daemon rejected request");
        }
        Ok(Frame::Response { id, error: None }) => {
            tracing::debug!(id = ?id, "daemon acknowledged request");
        }
        Ok(Frame::Other(method)) => {
            tracing::debug!(method = ?method, "ignoring frame");
        }
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed frame");
        }
    }
}

/// Drain the outbox onto the socket until closed or shut down
///
/// Returns the number of frames written. A write failure raises the shutdown flag.
pub async fn write_loop<W>(
    stream: &mut W,
    outbox: &mut OutboxReceiver,
    shutdown: &CancellationToken,
    poll: Duration,
) -> usize
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut ids = RequestIds::default();
    let mut written = 0;

    while !shutdown.is_cancelled() {
        let task = match outbox.next_within(poll).await {
            Dequeued::Task(task) => task,
            Dequeued::Empty => continue,
            Dequeued::Closed => break,
        };

        // Only a frame that exists consumes an id
        let frame = match RpcRequest::send(&task, ids.peek()).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(id = ids.peek(), error = %e, "failed to serialize send request");
                continue;
            }
        };
        let id = ids.next_id();

        if let Err(e) = write_frame(stream, &frame).await {
            tracing::error!(id, error = %e, "socket write failed");
            shutdown.cancel();
            break;
        }

        tracing::debug!(
            id,
            recipient = %task.recipient,
            attachments = task.attachments.len(),
            "sent message"
        );
        written += 1;
    }

    tracing::debug!(written, "writer loop stopped");
    written
}

async fn write_frame<W>(stream: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(frame).await?;
    stream.flush().await
}
