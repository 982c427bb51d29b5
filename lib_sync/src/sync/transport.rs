//! # Stream Transport
//!
//! The subscription side of the push channel: a `text/event-stream` GET held
//! open for the life of the connection. The transport is behind a trait so
//! the reconnect policy can be exercised against a scripted fake, the same
//! way the upstream client splits raw streaming from the REST retrieval
//! layer.

use std::collections::VecDeque;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use reqwest::header::ACCEPT;
use tokio::time::Duration;

/// Transport-level failures. Everything here is recoverable through the
/// client's reconnect loop.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("stream endpoint rejected the subscription: HTTP {status}")]
    EndpointRejected { status: u16 },
    #[error("stream transport failed: {source}")]
    Transport {
        #[source]
        source: anyhow::Error,
    },
    #[error("stream went silent past the watchdog window")]
    IdleTimeout,
}

/// One live subscription. `next_event` yields the data payload of each
/// event; `None` means the server closed the stream.
pub trait StreamConnection: Send {
    fn next_event(
        &mut self,
    ) -> impl std::future::Future<Output = Option<Result<String, StreamError>>> + Send;
}

/// Opens subscriptions. A fresh connection is requested for every
/// (re)connect attempt; the logical subscription identity lives above this.
pub trait StreamTransport: Send + Sync + 'static {
    type Connection: StreamConnection;

    fn connect(
        &self,
        endpoint: &str,
    ) -> impl std::future::Future<Output = Result<Self::Connection, StreamError>> + Send;
}

/// Incremental decoder for the `text/event-stream` wire format. Fed raw
/// chunks, emits complete event data payloads. `data:` lines accumulate
/// until a blank line dispatches them; comment lines and the remaining SSE
/// fields are skipped. Tolerates CRLF and chunk boundaries anywhere,
/// including mid-line.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning every event payload completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut completed = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    completed.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(rest) = line.strip_prefix("data:") {
                self.data_lines
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            } else if line.starts_with(':') {
                // Comment line, typically used as keep-alive filler.
            }
            // event:/id:/retry: fields are not part of the envelope contract.
        }
        completed
    }
}

/// Production transport: credentialed SSE over a pooled reqwest client. No
/// overall request timeout is set because the response body is expected to
/// stay open indefinitely.
pub struct SseTransport {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl SseTransport {
    pub fn new(auth_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .user_agent("IntelScout-Sync/0.1")
                .build()
                .unwrap_or_default(),
            auth_token,
        }
    }
}

impl StreamTransport for SseTransport {
    type Connection = SseConnection;

    async fn connect(&self, endpoint: &str) -> Result<SseConnection, StreamError> {
        let mut request = self
            .client
            .get(endpoint)
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| StreamError::Transport {
            source: e.into(),
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::EndpointRejected {
                status: status.as_u16(),
            });
        }

        Ok(SseConnection {
            bytes: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
        })
    }
}

pub struct SseConnection {
    bytes: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
}

impl StreamConnection for SseConnection {
    async fn next_event(&mut self) -> Option<Result<String, StreamError>> {
        loop {
            if let Some(payload) = self.ready.pop_front() {
                return Some(Ok(payload));
            }
            match self.bytes.next().await {
                Some(Ok(chunk)) => self.ready.extend(self.decoder.push(&chunk)),
                Some(Err(e)) => {
                    return Some(Err(StreamError::Transport { source: e.into() }));
                }
                None => return None,
            }
        }
    }
}
