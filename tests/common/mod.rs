//! Shared test utilities

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use signal_relay::providers::{ChatBackend, CompletionParams, ImageBackend};
use signal_relay::{Error, Result, Turn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

pub const BOT_NUMBER: &str = "+15550000000";

/// How long tests wait for anything to arrive
pub const WAIT: Duration = Duration::from_secs(3);

/// Chat backend that echoes the last message and records every request
#[derive(Default)]
pub struct MockChat {
    pub requests: Mutex<Vec<(Vec<Turn>, CompletionParams)>>,
    pub fail: bool,
}

impl MockChat {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatBackend for MockChat {
    async fn complete(&self, messages: &[Turn], params: CompletionParams) -> Result<String> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), params));
        if self.fail {
            return Err(Error::Backend("mock chat is down".to_string()));
        }
        let last = messages.last().map_or("", |t| t.content.as_str());
        Ok(format!("echo: {last}"))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Image backend that returns a fixed path and records prompts
pub struct MockImages {
    pub prompts: Mutex<Vec<String>>,
    pub output: PathBuf,
}

impl MockImages {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self {
            prompts: Mutex::default(),
            output: output.into(),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageBackend for MockImages {
    async fn generate(&self, prompt: &str) -> Result<PathBuf> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        Ok(self.output.clone())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Stand-in for the signal-cli daemon's TCP socket
pub struct FakeDaemon {
    listener: TcpListener,
    pub address: String,
}

/// Accepted connection from the relay
pub struct DaemonConn {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl FakeDaemon {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        Self { listener, address }
    }

    pub async fn accept(&self) -> DaemonConn {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("relay never connected")
            .unwrap();
        let (reader, writer) = stream.into_split();
        DaemonConn {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }
}

impl DaemonConn {
    /// Write raw bytes to the relay
    pub async fn write_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Push a `receive` notification carrying `envelope`
    pub async fn deliver(&mut self, envelope: Value) {
        let frame = json!({
            "jsonrpc": "2.0",
            "method": "receive",
            "params": { "envelope": envelope, "account": BOT_NUMBER },
        });
        self.write_raw(format!("{frame}\n").as_bytes()).await;
    }

    /// Next request the relay wrote
    pub async fn next_request(&mut self) -> Value {
        let line = tokio::time::timeout(WAIT, self.lines.next_line())
            .await
            .expect("no request from relay")
            .unwrap()
            .expect("relay closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Assert nothing is written for a short while
    pub async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(300), self.lines.next_line()).await;
        assert!(next.is_err(), "unexpected request: {next:?}");
    }
}

/// Direct message envelope
pub fn direct(from: &str, body: &str) -> Value {
    json!({
        "source": from,
        "sourceNumber": from,
        "timestamp": 1,
        "dataMessage": { "timestamp": 1, "message": body },
    })
}

/// Note-to-self envelope synced from the bot's own account
pub fn note_to_self(uuid: &str, body: &str) -> Value {
    json!({
        "sourceNumber": BOT_NUMBER,
        "sourceUuid": uuid,
        "syncMessage": { "sentMessage": {
            "message": body,
            "destinationNumber": BOT_NUMBER,
            "destinationUuid": uuid,
        }},
    })
}

/// One recorded HTTP request
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl RecordedRequest {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

/// Canned HTTP response
pub struct StubResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl StubResponse {
    pub fn json(value: &Value) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: value.to_string().into_bytes(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: b"stub error".to_vec(),
        }
    }

    pub fn bytes(body: &[u8]) -> Self {
        Self {
            status: 200,
            content_type: "application/octet-stream",
            body: body.to_vec(),
        }
    }

    /// Server-sent events, one `data:` line per event
    pub fn event_stream(events: &[Value]) -> Self {
        let body = events
            .iter()
            .map(|e| format!("data: {e}\n\n"))
            .collect::<String>();
        Self {
            status: 200,
            content_type: "text/event-stream",
            body: body.into_bytes(),
        }
    }
}

/// Minimal HTTP/1.1 server answering every request through a closure
pub struct HttpStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl HttpStub {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> StubResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handler = Arc::new(handler);
        let requests: Arc<Mutex<Vec<RecordedRequest>>> = Arc::default();

        let recorded = requests.clone();
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    serve_one(stream, handler.as_ref(), &recorded).await;
                });
            }
        });

        Self {
            base_url,
            requests,
            handle,
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for HttpStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one<F>(
    mut stream: tokio::net::TcpStream,
    handler: &F,
    recorded: &Mutex<Vec<RecordedRequest>>,
) where
    F: Fn(&RecordedRequest) -> StubResponse,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut head_lines = head.lines();
    let mut request_line = head_lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let content_length = head_lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let end = buf.len().min(header_end + content_length);
    let request = RecordedRequest {
        method,
        path,
        body: String::from_utf8_lossy(&buf[header_end..end]).to_string(),
    };
    let response = handler(&request);
    recorded.lock().unwrap().push(request);

    let head = format!(
        "HTTP/1.1 {} STUB\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.content_type,
        response.body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(&response.body).await;
    let _ = stream.shutdown().await;
}
