//! MCP Streamable HTTP client transport.
//!
//! Every outbound message is POSTed to the single MCP endpoint. The server
//! answers with a JSON body, an SSE stream, or `202 Accepted`; whatever
//! messages come back are forwarded onto one inbound channel.

use agent_core::error::{AgentError, Result};
use agent_core::protocol::JsonRpcMessage;
use agent_core::transport::{InboundStream, Transport};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use sse_stream::{Sse, SseStream};
use std::fmt::Display;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
const JSON_MIME_TYPE: &str = "application/json";

type InboundItem = Result<JsonRpcMessage>;

pub struct StreamableHttpTransport {
    client: reqwest::Client,
    url: String,
    session_id: RwLock<Option<String>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<InboundItem>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundItem>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamableHttpTransport {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(request_timeout)
            .user_agent(concat!("mcp-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to create HTTP client, using default config: {}", e);
                reqwest::Client::new()
            });
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            client,
            url: url.into(),
            session_id: RwLock::new(None),
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            shutdown_tx,
        }
    }

    /// Session id assigned by the server, if any.
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.read().await.clone()
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<InboundItem>> {
        self.inbound_tx
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| AgentError::Transport("transport closed".into()))
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let tx = self.sender()?;

        let mut request = self
            .client
            .post(&self.url)
            .header(ACCEPT, [JSON_MIME_TYPE, EVENT_STREAM_MIME_TYPE].join(", "))
            .json(message);
        if let Some(session_id) = self.session_id().await {
            request = request.header(HEADER_SESSION_ID, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("POST {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Transport(format!(
                "POST {} returned {}",
                self.url, status
            )));
        }

        if let Some(session_id) = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write().await = Some(session_id.to_string());
        }

        if matches!(status, StatusCode::ACCEPTED | StatusCode::NO_CONTENT) {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|ct| ct.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with(EVENT_STREAM_MIME_TYPE) {
            // The SSE body may stay open; don't hold the caller on it.
            let events = SseStream::from_byte_stream(response.bytes_stream());
            tokio::spawn(forward_sse(events, tx));
            return Ok(());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AgentError::Transport(format!("reading response body failed: {}", e)))?;
        // Some servers answer notifications with 200 and an empty body.
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        for message in parse_payload(&String::from_utf8_lossy(&body))? {
            let _ = tx.send(Ok(message));
        }
        Ok(())
    }

    async fn inbound(&self) -> Result<InboundStream> {
        let rx = self
            .inbound_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or_else(|| AgentError::Transport("inbound stream already taken".into()))?;

        let mut shutdown = self.shutdown_tx.subscribe();
        let stopped = async move {
            let _ = shutdown.wait_for(|closed| *closed).await;
        };
        Ok(UnboundedReceiverStream::new(rx).take_until(stopped).boxed())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        if let Ok(mut guard) = self.inbound_tx.lock() {
            guard.take();
        }

        if let Some(session_id) = self.session_id.write().await.take() {
            let result = self
                .client
                .delete(&self.url)
                .header(HEADER_SESSION_ID, session_id)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status() == StatusCode::METHOD_NOT_ALLOWED => {}
                Ok(resp) if !resp.status().is_success() => {
                    debug!("Session DELETE returned {}", resp.status());
                }
                Ok(_) => {}
                Err(e) => debug!("Session DELETE failed: {}", e),
            }
        }
        Ok(())
    }
}

/// Forward the payload of every SSE event onto the inbound channel.
async fn forward_sse<S, E>(events: S, tx: mpsc::UnboundedSender<InboundItem>)
where
    S: Stream<Item = std::result::Result<Sse, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let mut events = Box::pin(events);

    while let Some(event) = events.next().await {
        match event {
            // Keep-alives and id/retry-only events carry no data.
            Ok(Sse { data: Some(data), .. }) if !data.trim().is_empty() => {
                match parse_payload(&data) {
                    Ok(messages) => {
                        for message in messages {
                            let _ = tx.send(Ok(message));
                        }
                    }
                    Err(e) => warn!("Skipping malformed SSE event: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(AgentError::Transport(format!("SSE read failed: {}", e))));
                break;
            }
        }
    }
}

/// A payload is one message or a JSON-RPC batch.
fn parse_payload(text: &str) -> Result<Vec<JsonRpcMessage>> {
    let value: Value = serde_json::from_str(text)?;
    let messages = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<_>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(messages)
}
